//! Batch-wise tuning of proposal scales towards a target acceptance rate.
//!
//! After every batch the empirical acceptance of each coordinate is compared
//! with the target. The log scale moves by `delta = min(max_delta,
//! 1/sqrt(batch))`, a vanishing adaptation that keeps the chain ergodic.

use tracing::debug;

use crate::{metropolis::AcceptanceCounts, proposal::Proposal};

#[derive(Debug, Clone, Copy)]
pub struct ScaleAdaptSettings {
    /// Iterations per adaptation batch.
    pub batch_size: u64,
    /// Target acceptance rate. 0.44 is optimal for scalar random-walk MH.
    pub target_accept: f64,
    /// Upper limit of the log-scale change per batch.
    pub max_delta: f64,
    /// Batches that pass before adaptation starts.
    pub warmup_batches: u64,
    pub min_sigma: f64,
    pub max_sigma: f64,
}

impl Default for ScaleAdaptSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            target_accept: 0.44,
            max_delta: 0.01,
            warmup_batches: 0,
            min_sigma: 1e-8,
            max_sigma: 1e4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScaleAdapter {
    settings: ScaleAdaptSettings,
    batch: u64,
    start_accepted: Vec<u64>,
    start_proposed: Vec<u64>,
    frozen: Vec<bool>,
}

impl ScaleAdapter {
    pub fn new(settings: ScaleAdaptSettings, dim: usize) -> Self {
        Self {
            settings,
            batch: 0,
            start_accepted: vec![0; dim],
            start_proposed: vec![0; dim],
            frozen: vec![false; dim],
        }
    }

    /// Number of completed batches.
    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn is_frozen(&self, coordinate: usize) -> bool {
        self.frozen[coordinate]
    }

    pub fn delta(&self, batch: u64) -> f64 {
        self.settings
            .max_delta
            .min((batch.max(1) as f64).sqrt().recip())
    }

    /// Forget the counters of the running batch, e.g. after the acceptance
    /// counters were reset.
    pub fn restart_batch(&mut self, counts: &AcceptanceCounts) {
        self.start_accepted.copy_from_slice(&counts.accepted);
        self.start_proposed.copy_from_slice(&counts.proposed);
    }

    /// Called once per completed iteration. Adapts at batch boundaries and
    /// returns whether it did.
    pub fn end_iteration(
        &mut self,
        iteration: u64,
        counts: &AcceptanceCounts,
        proposal: &mut Proposal,
    ) -> bool {
        if self.settings.batch_size == 0 || iteration % self.settings.batch_size != 0 {
            return false;
        }
        self.batch += 1;

        if self.batch <= self.settings.warmup_batches {
            self.restart_batch(counts);
            return false;
        }

        let delta = self.delta(self.batch);
        let (min_sigma, max_sigma) = (self.settings.min_sigma, self.settings.max_sigma);
        for coordinate in 0..proposal.len() {
            if self.frozen[coordinate] {
                continue;
            }
            let proposed = counts.proposed[coordinate].saturating_sub(self.start_proposed[coordinate]);
            if proposed == 0 {
                continue;
            }
            let accepted = counts.accepted[coordinate].saturating_sub(self.start_accepted[coordinate]);
            let rate = accepted as f64 / proposed as f64;

            let factor = if rate > self.settings.target_accept {
                delta.exp()
            } else {
                (-delta).exp()
            };
            let sigma = proposal.scale(coordinate) * factor;
            if !(min_sigma..=max_sigma).contains(&sigma) {
                self.frozen[coordinate] = true;
                debug!(coordinate, sigma, "proposal scale hit its bound, freezing");
            }
            proposal.set_scale(coordinate, sigma.clamp(min_sigma, max_sigma));
        }

        self.restart_batch(counts);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metropolis::metropolis_step, model::test_models::VectorModel,
        proposal::ProposalSettings, scoring::FnScore,
    };
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn delta_vanishes() {
        let adapter = ScaleAdapter::new(ScaleAdaptSettings::default(), 1);
        assert_eq!(adapter.delta(1), 0.01);
        assert_eq!(adapter.delta(40_000), 0.005);
    }

    #[test]
    fn scale_grows_when_acceptance_is_high() {
        let model = VectorModel::new(0, vec![0.; 2]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        let mut adapter = ScaleAdapter::new(ScaleAdaptSettings::default(), 2);
        let mut counts = AcceptanceCounts::new(2);
        for iteration in 1..=50 {
            counts.register(0, true);
            counts.register(1, false);
            adapter.end_iteration(iteration, &counts, &mut proposal);
        }
        assert_eq!(adapter.batch(), 1);
        approx::assert_relative_eq!(proposal.scale(0), 0.1 * 0.01f64.exp());
        approx::assert_relative_eq!(proposal.scale(1), 0.1 * (-0.01f64).exp());
    }

    #[test]
    fn warmup_batches_do_not_adapt() {
        let model = VectorModel::new(0, vec![0.]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        let settings = ScaleAdaptSettings {
            batch_size: 10,
            warmup_batches: 2,
            ..Default::default()
        };
        let mut adapter = ScaleAdapter::new(settings, 1);
        let mut counts = AcceptanceCounts::new(1);
        for iteration in 1..=20 {
            counts.register(0, true);
            assert!(!adapter.end_iteration(iteration, &counts, &mut proposal));
        }
        assert_eq!(proposal.scale(0), 0.1);
        counts.register(0, true);
        for iteration in 21..=30 {
            adapter.end_iteration(iteration, &counts, &mut proposal);
        }
        assert!(proposal.scale(0) > 0.1);
    }

    #[test]
    fn scale_is_clamped_and_frozen() {
        let model = VectorModel::new(0, vec![0.]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        let settings = ScaleAdaptSettings {
            batch_size: 1,
            max_delta: 1.,
            max_sigma: 0.2,
            ..Default::default()
        };
        let mut adapter = ScaleAdapter::new(settings, 1);
        let mut counts = AcceptanceCounts::new(1);
        for iteration in 1..=10 {
            counts.register(0, true);
            adapter.end_iteration(iteration, &counts, &mut proposal);
            assert!(proposal.scale(0) <= 0.2);
        }
        assert!(adapter.is_frozen(0));
        assert_eq!(proposal.scale(0), 0.2);
    }

    #[test]
    fn acceptance_converges_to_target() {
        let scoring = FnScore(|model: &VectorModel| -0.5 * model.values[0] * model.values[0]);
        let mut model = VectorModel::new(0, vec![0.]);
        let settings = ProposalSettings {
            dynamics_sigma: 1.,
            ..Default::default()
        };
        let mut proposal = Proposal::new(&model, &settings);
        let mut adapter = ScaleAdapter::new(ScaleAdaptSettings::default(), 1);
        let mut counts = AcceptanceCounts::new(1);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let mut logp = 0.;
        let mut iteration = 0;
        while adapter.batch() < 200 {
            iteration += 1;
            logp = metropolis_step(&mut model, logp, &mut proposal, &scoring, &mut counts, &mut rng)
                .unwrap()
                .log_posterior;
            adapter.end_iteration(iteration, &counts, &mut proposal);
        }

        let mut after = AcceptanceCounts::new(1);
        for _ in 0..20_000 {
            logp = metropolis_step(&mut model, logp, &mut proposal, &scoring, &mut after, &mut rng)
                .unwrap()
                .log_posterior;
        }
        let rate = after.rate();
        assert!((rate - 0.44).abs() < 0.1, "acceptance rate {rate}");
    }
}
