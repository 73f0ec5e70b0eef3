//! Step size tuning for the HMC kernel.

/// Dual averaging parameters (Hoffman & Gelman 2014, section 3.2.1).
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    /// Decay exponent of the averaged iterate.
    pub k: f64,
    /// Stabilizes early iterations.
    pub t0: f64,
    /// Shrinkage towards `mu`.
    pub gamma: f64,
    /// `mu = ln(bias_factor * initial_step)`.
    pub bias_factor: f64,
}

impl Default for DualAverageOptions {
    fn default() -> Self {
        Self {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            bias_factor: 10.,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualAverage {
    options: DualAverageOptions,
    mu: f64,
    mean_error: f64,
    log_step: f64,
    log_step_bar: f64,
    iteration: u64,
}

impl DualAverage {
    pub fn new(options: DualAverageOptions, initial_step: f64) -> Self {
        let log_step = initial_step.ln();
        Self {
            options,
            mu: (options.bias_factor * initial_step).ln(),
            mean_error: 0.,
            log_step,
            log_step_bar: log_step,
            iteration: 0,
        }
    }

    /// Feed the acceptance probability of the last transition.
    pub fn advance(&mut self, accept_prob: f64, target: f64) {
        self.iteration += 1;
        let t = self.iteration as f64;
        let DualAverageOptions { k, t0, gamma, .. } = self.options;

        let weight = 1. / (t + t0);
        self.mean_error += weight * (target - accept_prob - self.mean_error);
        self.log_step = self.mu - t.sqrt() / gamma * self.mean_error;

        let decay = t.powf(-k);
        self.log_step_bar = decay * self.log_step + (1. - decay) * self.log_step_bar;
    }

    /// Step size to use while tuning.
    pub fn step_size(&self) -> f64 {
        self.log_step.exp()
    }

    /// Averaged step size to use once tuning ends.
    pub fn final_step_size(&self) -> f64 {
        self.log_step_bar.exp()
    }

    pub fn iterations(&self) -> u64 {
        self.iteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_acceptance_shrinks_step() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..50 {
            adapt.advance(0.1, 0.65);
        }
        assert!(adapt.step_size() < 1.);
        assert!(adapt.final_step_size() < 1.);
        assert_eq!(adapt.iterations(), 50);
    }

    #[test]
    fn high_acceptance_grows_step() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 0.01);
        for _ in 0..50 {
            adapt.advance(1., 0.65);
        }
        assert!(adapt.step_size() > 0.01);
    }
}
