//! Hamiltonian Monte Carlo transitions over all proposal coordinates.

use rand::Rng;
use rand_distr::StandardNormal;
use tracing::trace;

use crate::{
    error::ScoreError,
    math::{all_finite, axpy, vector_dot},
    metropolis::{accept_move, score_candidate, StepOutcome},
    model::UnitModel,
    scoring::{GradientEstimator, ScoringFunction},
    stepsize::{DualAverage, DualAverageOptions},
};

#[derive(Debug, Clone, Copy)]
pub struct HmcSettings {
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    /// Tune the step size by dual averaging while the chain is burning in.
    pub adapt_step_size: bool,
    pub target_accept: f64,
    pub dual_average: DualAverageOptions,
}

impl Default for HmcSettings {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            num_leapfrog_steps: 10,
            adapt_step_size: true,
            target_accept: 0.65,
            dual_average: DualAverageOptions::default(),
        }
    }
}

/// Diagnostics of the last transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmcInfo {
    pub accept_prob: f64,
    pub energy_error: f64,
    pub divergent: bool,
}

pub struct HmcSampler {
    settings: HmcSettings,
    indices: Vec<usize>,
    step_size: f64,
    step_size_adapt: DualAverage,
    position: Vec<f64>,
    initial: Vec<f64>,
    momentum: Vec<f64>,
    gradient: Vec<f64>,
    full_gradient: Vec<f64>,
    last_info: HmcInfo,
}

impl HmcSampler {
    /// `indices` are the flat model parameters the trajectory moves.
    pub fn new(settings: HmcSettings, indices: Vec<usize>, num_params: usize) -> Self {
        let dim = indices.len();
        Self {
            step_size: settings.step_size,
            step_size_adapt: DualAverage::new(settings.dual_average, settings.step_size),
            settings,
            indices,
            position: vec![0.; dim],
            initial: vec![0.; dim],
            momentum: vec![0.; dim],
            gradient: vec![0.; dim],
            full_gradient: vec![0.; num_params],
            last_info: HmcInfo::default(),
        }
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn last_info(&self) -> HmcInfo {
        self.last_info
    }

    fn write_position<U: UnitModel>(&self, model: &mut U, values: &[f64]) {
        for (&idx, &val) in self.indices.iter().zip(values) {
            model.set_param(idx, val);
        }
        model.invalidate_caches();
    }

    /// Gradient of the moved coordinates at the model's current state.
    ///
    /// Returns `Ok(false)` for a recoverable failure or a non-finite gradient.
    fn update_gradient<U: UnitModel>(
        &mut self,
        model: &U,
        estimator: &dyn GradientEstimator<U>,
    ) -> Result<bool, ScoreError> {
        match estimator.gradient(model, &mut self.full_gradient) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => return Ok(false),
            Err(err) => return Err(err),
        }
        for (out, &idx) in self.gradient.iter_mut().zip(&self.indices) {
            *out = self.full_gradient[idx];
        }
        Ok(all_finite(&self.gradient))
    }

    /// Simulate the leapfrog trajectory. Returns `Ok(false)` on divergence.
    fn leapfrog<U: UnitModel>(
        &mut self,
        model: &mut U,
        estimator: &dyn GradientEstimator<U>,
    ) -> Result<bool, ScoreError> {
        let eps = self.step_size;
        let steps = self.settings.num_leapfrog_steps.max(1);

        if !self.update_gradient(model, estimator)? {
            return Ok(false);
        }
        axpy(&self.gradient, &mut self.momentum, 0.5 * eps);

        for step in 0..steps {
            axpy(&self.momentum, &mut self.position, eps);
            if !all_finite(&self.position) {
                return Ok(false);
            }
            let position = std::mem::take(&mut self.position);
            self.write_position(model, &position);
            self.position = position;

            if !self.update_gradient(model, estimator)? {
                return Ok(false);
            }
            let scale = if step + 1 < steps { eps } else { 0.5 * eps };
            axpy(&self.gradient, &mut self.momentum, scale);
        }
        Ok(true)
    }

    /// One HMC transition. `tuning` enables step size adaptation.
    pub fn step<U: UnitModel, R: Rng + ?Sized>(
        &mut self,
        model: &mut U,
        current_logp: f64,
        scoring: &dyn ScoringFunction<U>,
        estimator: &dyn GradientEstimator<U>,
        tuning: bool,
        rng: &mut R,
    ) -> Result<StepOutcome, ScoreError> {
        for (pos, &idx) in self.position.iter_mut().zip(&self.indices) {
            *pos = model.param(idx);
        }
        self.initial.copy_from_slice(&self.position);
        self.momentum
            .iter_mut()
            .for_each(|p| *p = rng.sample(StandardNormal));
        let initial_energy = -current_logp + 0.5 * vector_dot(&self.momentum, &self.momentum);

        let finished = match self.leapfrog(model, estimator) {
            Ok(finished) => finished,
            Err(err) => {
                let initial = std::mem::take(&mut self.initial);
                self.write_position(model, &initial);
                self.initial = initial;
                return Err(err);
            }
        };

        let new_logp = if finished {
            match score_candidate(scoring, model) {
                Ok(logp) => logp,
                Err(err) => {
                    let initial = std::mem::take(&mut self.initial);
                    self.write_position(model, &initial);
                    self.initial = initial;
                    return Err(err);
                }
            }
        } else {
            f64::NEG_INFINITY
        };

        let new_energy = -new_logp + 0.5 * vector_dot(&self.momentum, &self.momentum);
        let log_ratio = initial_energy - new_energy;
        let divergent = !log_ratio.is_finite();
        let accept_prob = if divergent { 0. } else { log_ratio.min(0.).exp() };
        let accepted = !divergent && accept_move(rng, log_ratio);

        self.last_info = HmcInfo {
            accept_prob,
            energy_error: -log_ratio,
            divergent,
        };
        if divergent {
            trace!(step_size = self.step_size, "divergent trajectory");
        }

        if self.settings.adapt_step_size {
            if tuning {
                self.step_size_adapt
                    .advance(accept_prob, self.settings.target_accept);
                self.step_size = self.step_size_adapt.step_size();
            } else {
                self.step_size = self.step_size_adapt.final_step_size();
            }
        }

        if accepted {
            Ok(StepOutcome {
                accepted,
                log_posterior: new_logp,
            })
        } else {
            let initial = std::mem::take(&mut self.initial);
            self.write_position(model, &initial);
            self.initial = initial;
            Ok(StepOutcome {
                accepted,
                log_posterior: current_logp,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::test_models::VectorModel,
        scoring::{FnGradient, FnScore},
    };
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn logp(model: &VectorModel) -> f64 {
        model.values.iter().map(|x| -0.5 * (x - 1.) * (x - 1.)).sum()
    }

    fn grad(model: &VectorModel, out: &mut [f64]) {
        for (g, x) in out.iter_mut().zip(&model.values) {
            *g = -(x - 1.);
        }
    }

    #[test]
    fn samples_shifted_normal() {
        let scoring = FnScore(logp);
        let gradient = FnGradient(grad);
        let mut model = VectorModel::new(0, vec![0.; 3]);
        let mut sampler = HmcSampler::new(HmcSettings::default(), vec![0, 1, 2], 3);
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let mut current = logp(&model);
        let mut mean = [0f64; 3];
        let mut accepted = 0;
        let draws = 2000;
        for i in 0..(draws + 200) {
            let outcome = sampler
                .step(&mut model, current, &scoring, &gradient, i < 200, &mut rng)
                .unwrap();
            current = outcome.log_posterior;
            approx::assert_relative_eq!(current, logp(&model), epsilon = 1e-12);
            if i >= 200 {
                accepted += outcome.accepted as usize;
                for (m, x) in mean.iter_mut().zip(&model.values) {
                    *m += x / draws as f64;
                }
            }
        }
        assert!(accepted > draws / 4);
        for m in mean {
            assert!((m - 1.).abs() < 0.2, "mean {m}");
        }
    }

    #[test]
    fn divergence_restores_state() {
        let scoring = FnScore(logp);
        let gradient = FnGradient(|_: &VectorModel, out: &mut [f64]| out.fill(f64::NAN));
        let mut model = VectorModel::new(0, vec![0.5, 0.5]);
        let settings = HmcSettings {
            adapt_step_size: false,
            ..Default::default()
        };
        let mut sampler = HmcSampler::new(settings, vec![0, 1], 2);
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let current = logp(&model);
        let outcome = sampler
            .step(&mut model, current, &scoring, &gradient, false, &mut rng)
            .unwrap();
        assert!(!outcome.accepted);
        assert!(sampler.last_info().divergent);
        assert_eq!(model.values, vec![0.5, 0.5]);
    }
}
