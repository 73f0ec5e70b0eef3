/// Keeps the highest log posterior seen together with a snapshot of its state.
#[derive(Debug, Clone)]
pub struct BestRecorder<U> {
    log_posterior: f64,
    snapshot: Option<U>,
}

impl<U> Default for BestRecorder<U> {
    fn default() -> Self {
        Self {
            log_posterior: f64::NEG_INFINITY,
            snapshot: None,
        }
    }
}

impl<U: Clone> BestRecorder<U> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a state. It is only cloned if it beats the current best.
    pub fn record(&mut self, log_posterior: f64, state: &U) -> bool {
        let first = self.snapshot.is_none() && !log_posterior.is_nan();
        if first || log_posterior > self.log_posterior {
            self.log_posterior = log_posterior;
            self.snapshot = Some(state.clone());
            true
        } else {
            false
        }
    }

    pub fn log_posterior(&self) -> f64 {
        self.log_posterior
    }

    pub fn best(&self) -> Option<&U> {
        self.snapshot.as_ref()
    }

    pub fn take(&mut self) -> Option<(f64, U)> {
        let snapshot = self.snapshot.take()?;
        let logp = std::mem::replace(&mut self.log_posterior, f64::NEG_INFINITY);
        Some((logp, snapshot))
    }

    pub fn reset(&mut self) {
        self.log_posterior = f64::NEG_INFINITY;
        self.snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_maximum() {
        let mut recorder = BestRecorder::new();
        assert!(recorder.record(-3., &vec![3.]));
        assert!(recorder.record(-1., &vec![1.]));
        assert!(!recorder.record(-2., &vec![2.]));
        assert_eq!(recorder.log_posterior(), -1.);
        assert_eq!(recorder.best(), Some(&vec![1.]));
        assert_eq!(recorder.take(), Some((-1., vec![1.])));
        assert!(recorder.best().is_none());
    }

    #[test]
    fn first_state_is_kept_even_if_invalid() {
        let mut recorder = BestRecorder::new();
        assert!(recorder.record(f64::NEG_INFINITY, &1));
        assert!(!recorder.record(f64::NEG_INFINITY, &2));
        assert_eq!(recorder.best(), Some(&1));
    }
}
