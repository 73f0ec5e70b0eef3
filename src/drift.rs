//! Gaussian-process control-point sampler for time-varying coefficients.
//!
//! Each coefficient is represented explicitly at a subsample of the unit's
//! time axis (the control points). A move replaces one control value by a
//! draw from its leave-one-out GP predictive, redraws the remaining time
//! points conditioned on the new control values and accepts or rejects the
//! pair with the Metropolis-Hastings rule. Control points are visited
//! round-robin, so one cycle touches every coefficient at every control
//! point exactly once.

use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::{
    error::{GpError, UnitFailure},
    gp::{CholeskySettings, ConditionalWeights, Predictive, TrajectoryConditional},
    math::{all_finite, normal_logpdf},
    metropolis::{accept_move, score_candidate, AcceptanceCounts},
    model::UnitModel,
    scoring::{CovarianceKernel, ScoringFunction},
};

#[derive(Debug, Clone, Copy)]
pub struct DriftSettings {
    /// Desired number of time steps between two control points.
    pub target_spacing: usize,
    /// Cycles discarded before the sampler counts as burned in.
    pub burn_in: u64,
    pub cholesky: CholeskySettings,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            target_spacing: 10,
            burn_in: 0,
            cholesky: CholeskySettings::default(),
        }
    }
}

/// Subsample of a unit's time axis with one value per coefficient and point.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPointSet {
    indices: Vec<usize>,
    times: Vec<f64>,
    free_indices: Vec<usize>,
    free_times: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl ControlPointSet {
    /// `max(3, floor(num_times / target_spacing))`, capped at `num_times`.
    pub fn count_for(num_times: usize, target_spacing: usize) -> usize {
        (num_times / target_spacing.max(1)).max(3).min(num_times)
    }

    pub fn new<U: UnitModel>(model: &U, target_spacing: usize) -> Result<Self, GpError> {
        let times = model.times();
        let n = times.len();
        if n < 3 {
            return Err(GpError::TooFewTimePoints(n));
        }
        if model.num_drift_coefficients() == 0 {
            return Err(GpError::NoCoefficients);
        }

        let count = Self::count_for(n, target_spacing);
        // Evenly spread, first and last time point included. Distinct since count <= n.
        let indices: Vec<usize> = (0..count)
            .map(|k| (k * (n - 1) + (count - 1) / 2) / (count - 1))
            .collect();
        let free_indices: Vec<usize> = (0..n).filter(|idx| !indices.contains(idx)).collect();

        let mut set = Self {
            times: indices.iter().map(|&idx| times[idx]).collect(),
            free_times: free_indices.iter().map(|&idx| times[idx]).collect(),
            indices,
            free_indices,
            values: vec![vec![0.; count]; model.num_drift_coefficients()],
        };
        set.sync_from(model)?;
        Ok(set)
    }

    /// Read the control values from the model's trajectories.
    pub fn sync_from<U: UnitModel>(&mut self, model: &U) -> Result<(), GpError> {
        let expected = model.times().len();
        for (coefficient, values) in self.values.iter_mut().enumerate() {
            let trajectory = model.trajectory(coefficient);
            if trajectory.len() != expected {
                return Err(GpError::TrajectoryLength {
                    coefficient,
                    expected,
                    found: trajectory.len(),
                });
            }
            for (val, &idx) in values.iter_mut().zip(&self.indices) {
                *val = trajectory[idx];
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_coefficients(&self) -> usize {
        self.values.len()
    }

    /// Time indices of the control points.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self, coefficient: usize) -> &[f64] {
        &self.values[coefficient]
    }
}

/// Result of a single control-point move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftStep {
    pub coefficient: usize,
    pub point: usize,
    pub accepted: bool,
    /// The move was skipped because of a numerical failure.
    pub skipped: bool,
    pub log_posterior: f64,
}

/// Summary of one cycle over all coefficients and control points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCycle {
    pub accepted: usize,
    pub skipped: usize,
    pub log_posterior: f64,
}

#[derive(Debug, Clone)]
pub struct DriftSampler {
    settings: DriftSettings,
    control: Option<ControlPointSet>,
    times: Vec<f64>,
    sample_index: usize,
    loo: Vec<Vec<Option<ConditionalWeights>>>,
    trajectories: Vec<Option<TrajectoryConditional>>,
    counts: AcceptanceCounts,
    cycles: u64,
}

impl DriftSampler {
    pub fn new(settings: DriftSettings) -> Self {
        Self {
            settings,
            control: None,
            times: Vec::new(),
            sample_index: 0,
            loo: Vec::new(),
            trajectories: Vec::new(),
            counts: AcceptanceCounts::default(),
            cycles: 0,
        }
    }

    pub fn control_points(&self) -> Option<&ControlPointSet> {
        self.control.as_ref()
    }

    /// Flat index `coefficient * num_points + point` of the next move.
    pub fn sample_index(&self) -> usize {
        self.sample_index
    }

    /// Moves per cycle.
    pub fn cycle_len(&self) -> usize {
        self.control
            .as_ref()
            .map(|set| set.len() * set.num_coefficients())
            .unwrap_or(0)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_burned_in(&self) -> bool {
        self.cycles >= self.settings.burn_in
    }

    pub fn counts(&self) -> &AcceptanceCounts {
        &self.counts
    }

    /// Rebuild the control points if the model's time axis changed, and
    /// pick up control values from its trajectories.
    pub fn ensure_control_points<U: UnitModel>(&mut self, model: &U) -> Result<(), GpError> {
        if let Some(set) = self.control.as_mut() {
            if self.times.as_slice() == model.times()
                && set.num_coefficients() == model.num_drift_coefficients()
            {
                return set.sync_from(model);
            }
        }

        let set = ControlPointSet::new(model, self.settings.target_spacing)?;
        self.times = model.times().to_vec();
        self.loo = vec![vec![None; set.len()]; set.num_coefficients()];
        self.trajectories = vec![None; set.num_coefficients()];
        self.counts = AcceptanceCounts::new(set.len() * set.num_coefficients());
        self.sample_index = 0;
        self.control = Some(set);
        Ok(())
    }

    /// Leave-one-out predictive of a control point given the other control
    /// points of the same coefficient.
    pub fn loo_predictive(
        &mut self,
        kernel: &dyn CovarianceKernel,
        coefficient: usize,
        point: usize,
    ) -> Result<Predictive, GpError> {
        let Some(set) = self.control.as_ref() else {
            return Err(GpError::NoCoefficients);
        };
        let leave_out = |values: &[f64]| -> Vec<f64> {
            values
                .iter()
                .enumerate()
                .filter(|&(idx, _)| idx != point)
                .map(|(_, &val)| val)
                .collect()
        };
        let slot = &mut self.loo[coefficient][point];
        let weights = match slot.take() {
            Some(weights) => weights,
            None => ConditionalWeights::new(
                kernel,
                coefficient,
                &leave_out(&set.times),
                set.times[point],
                &self.settings.cholesky,
            )?,
        };
        let pred = weights.predict(&leave_out(&set.values[coefficient]));
        *slot = Some(weights);
        Ok(pred)
    }

    fn trajectory_conditional(
        &mut self,
        kernel: &dyn CovarianceKernel,
        coefficient: usize,
    ) -> Result<TrajectoryConditional, GpError> {
        let Some(set) = self.control.as_ref() else {
            return Err(GpError::NoCoefficients);
        };
        match self.trajectories[coefficient].take() {
            Some(cond) => Ok(cond),
            None => TrajectoryConditional::new(
                kernel,
                coefficient,
                &set.times,
                &set.free_times,
                &self.settings.cholesky,
            ),
        }
    }

    fn skip(&self, coefficient: usize, point: usize, log_posterior: f64, err: GpError) -> DriftStep {
        warn!(coefficient, point, error = %err, "skipping drift move");
        DriftStep {
            coefficient,
            point,
            accepted: false,
            skipped: true,
            log_posterior,
        }
    }

    /// One control-point move.
    pub fn step<U: UnitModel, R: Rng + ?Sized>(
        &mut self,
        model: &mut U,
        current_logp: f64,
        scoring: &dyn ScoringFunction<U>,
        kernel: &dyn CovarianceKernel,
        rng: &mut R,
    ) -> Result<DriftStep, UnitFailure> {
        self.ensure_control_points(model)?;
        let num_points = self.control.as_ref().map(|set| set.len()).unwrap_or(0);
        if num_points == 0 {
            return Err(GpError::NoCoefficients.into());
        }
        let flat = self.sample_index;
        let (coefficient, point) = (flat / num_points, flat % num_points);
        self.sample_index = (self.sample_index + 1) % self.cycle_len();

        let pred = match self.loo_predictive(kernel, coefficient, point) {
            Ok(pred) => pred,
            Err(err) if err.is_recoverable() => {
                return Ok(self.skip(coefficient, point, current_logp, err))
            }
            Err(err) => return Err(err.into()),
        };
        let cond = match self.trajectory_conditional(kernel, coefficient) {
            Ok(cond) => cond,
            Err(err) if err.is_recoverable() => {
                return Ok(self.skip(coefficient, point, current_logp, err))
            }
            Err(err) => return Err(err.into()),
        };

        let var = pred.var.max(f64::EPSILON * f64::EPSILON);
        let step: f64 = rng.sample(StandardNormal);
        let new_value = pred.mean + var.sqrt() * step;

        let Some(set) = self.control.as_ref() else {
            return Err(GpError::NoCoefficients.into());
        };
        let old_controls = set.values[coefficient].clone();
        let mut new_controls = old_controls.clone();
        new_controls[point] = new_value;

        let old_trajectory = model.trajectory(coefficient).to_vec();
        let old_free: Vec<f64> = set.free_indices.iter().map(|&idx| old_trajectory[idx]).collect();
        let z: Vec<f64> = (0..cond.num_free())
            .map(|_| rng.sample(StandardNormal))
            .collect();
        let new_free = cond.draw(&new_controls, &z);

        let log_fwd = normal_logpdf(new_value, pred.mean, var)
            + cond.log_density(&new_controls, &new_free);
        let log_bwd = normal_logpdf(old_controls[point], pred.mean, var)
            + cond.log_density(&old_controls, &old_free);

        let mut new_trajectory = old_trajectory.clone();
        for (&idx, &val) in set.indices.iter().zip(&new_controls) {
            new_trajectory[idx] = val;
        }
        for (&idx, &val) in set.free_indices.iter().zip(&new_free) {
            new_trajectory[idx] = val;
        }
        self.trajectories[coefficient] = Some(cond);

        if !all_finite(&new_trajectory) {
            self.counts.register(flat, false);
            return Ok(DriftStep {
                coefficient,
                point,
                accepted: false,
                skipped: true,
                log_posterior: current_logp,
            });
        }

        model.set_trajectory(coefficient, &new_trajectory);
        model.invalidate_caches();
        let new_logp = match score_candidate(scoring, model) {
            Ok(logp) => logp,
            Err(err) => {
                model.set_trajectory(coefficient, &old_trajectory);
                model.invalidate_caches();
                return Err(err.into());
            }
        };

        let log_ratio = new_logp - current_logp + log_bwd - log_fwd;
        let accepted = new_logp != f64::NEG_INFINITY && accept_move(rng, log_ratio);
        self.counts.register(flat, accepted);

        if accepted {
            if let Some(set) = self.control.as_mut() {
                set.values[coefficient][point] = new_value;
            }
        } else {
            model.set_trajectory(coefficient, &old_trajectory);
            model.invalidate_caches();
        }

        Ok(DriftStep {
            coefficient,
            point,
            accepted,
            skipped: false,
            log_posterior: if accepted { new_logp } else { current_logp },
        })
    }

    /// One pass over every coefficient at every control point.
    pub fn cycle<U: UnitModel, R: Rng + ?Sized>(
        &mut self,
        model: &mut U,
        mut current_logp: f64,
        scoring: &dyn ScoringFunction<U>,
        kernel: &dyn CovarianceKernel,
        rng: &mut R,
    ) -> Result<DriftCycle, UnitFailure> {
        self.ensure_control_points(model)?;
        let mut accepted = 0;
        let mut skipped = 0;
        for _ in 0..self.cycle_len() {
            let step = self.step(model, current_logp, scoring, kernel, rng)?;
            accepted += step.accepted as usize;
            skipped += step.skipped as usize;
            current_logp = step.log_posterior;
        }
        self.cycles += 1;
        Ok(DriftCycle {
            accepted,
            skipped,
            log_posterior: current_logp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gp::test_kernels::SquaredExponential, model::test_models::DriftModel,
        recorder::BestRecorder, scoring::FnScore,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn kernel() -> SquaredExponential {
        SquaredExponential {
            variance: 1.,
            length_scale: 3.,
        }
    }

    #[test]
    fn control_point_count() {
        assert_eq!(ControlPointSet::count_for(100, 10), 10);
        assert_eq!(ControlPointSet::count_for(25, 10), 3);
        assert_eq!(ControlPointSet::count_for(3, 10), 3);
        assert_eq!(ControlPointSet::count_for(7, 1), 7);
    }

    #[test]
    fn control_points_span_time_axis() {
        let times: Vec<f64> = (0..21).map(|t| t as f64).collect();
        let model = DriftModel::new(times, 2);
        let set = ControlPointSet::new(&model, 5).unwrap();
        assert_eq!(set.indices(), &[0, 7, 13, 20]);
        assert_eq!(set.num_coefficients(), 2);

        let err = ControlPointSet::new(&DriftModel::new(vec![0., 1.], 1), 1).unwrap_err();
        assert_eq!(err, GpError::TooFewTimePoints(2));
    }

    #[test]
    fn round_robin_covers_every_point() {
        let times: Vec<f64> = (0..12).map(|t| t as f64).collect();
        let mut model = DriftModel::new(times, 2);
        let scoring = FnScore(|_: &DriftModel| 0.);
        let kernel = kernel();
        let mut sampler = DriftSampler::new(DriftSettings {
            target_spacing: 4,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut visited = Vec::new();
        for _ in 0..6 {
            let step = sampler
                .step(&mut model, 0., &scoring, &kernel, &mut rng)
                .unwrap();
            visited.push((step.coefficient, step.point));
        }
        assert_eq!(
            visited,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
        assert_eq!(sampler.sample_index(), 0);
        assert!(model.invalidations > 0);
    }

    #[test]
    fn trajectory_passes_through_control_values() {
        let times: Vec<f64> = (0..15).map(|t| t as f64).collect();
        let mut model = DriftModel::new(times, 1);
        let scoring = FnScore(|_: &DriftModel| 0.);
        let kernel = kernel();
        let mut sampler = DriftSampler::new(DriftSettings {
            target_spacing: 5,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        for _ in 0..5 {
            sampler
                .cycle(&mut model, 0., &scoring, &kernel, &mut rng)
                .unwrap();
        }
        let set = sampler.control_points().unwrap();
        for (&idx, &val) in set.indices().iter().zip(set.values(0)) {
            assert_eq!(model.trajectories[0][idx], val);
        }
        assert!(model.trajectories[0].iter().any(|&v| v != 0.));
        assert_eq!(sampler.cycles(), 5);
    }

    #[test]
    fn loo_mean_matches_three_point_formula() {
        let times = vec![0., 1.5, 4.];
        let mut model = DriftModel::new(times.clone(), 1);
        model.trajectories[0] = vec![0.4, -0.2, 0.9];
        let scoring = FnScore(|_: &DriftModel| 0.);
        let kernel = kernel();
        let mut sampler = DriftSampler::new(DriftSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        // One cycle resamples every control point, then point 1 is predicted
        // from the current values at points 0 and 2.
        sampler
            .cycle(&mut model, 0., &scoring, &kernel, &mut rng)
            .unwrap();
        let set = sampler.control_points().unwrap();
        assert_eq!(set.values(0), model.trajectories[0].as_slice());
        let f0 = model.trajectories[0][0];
        let f2 = model.trajectories[0][2];

        let k = |s: f64, t: f64| {
            let d = (s - t) / 3.;
            (-0.5 * d * d).exp()
        };
        let (a, b, d) = (k(times[0], times[0]), k(times[0], times[2]), k(times[2], times[2]));
        let det = a * d - b * b;
        let (c0, c2) = (k(times[1], times[0]), k(times[1], times[2]));
        let expected_mean = (c0 * (d * f0 - b * f2) + c2 * (a * f2 - b * f0)) / det;
        let expected_var = 1. - (c0 * (d * c0 - b * c2) + c2 * (a * c2 - b * c0)) / det;

        let pred = sampler.loo_predictive(&kernel, 0, 1).unwrap();
        assert_relative_eq!(pred.mean, expected_mean, epsilon = 1e-6);
        assert_relative_eq!(pred.var, expected_var, epsilon = 1e-6);
    }

    #[test]
    fn time_axis_change_regenerates_control_points() {
        let mut model = DriftModel::new((0..10).map(|t| t as f64).collect(), 1);
        let scoring = FnScore(|_: &DriftModel| 0.);
        let kernel = kernel();
        let mut sampler = DriftSampler::new(DriftSettings {
            target_spacing: 3,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        sampler
            .step(&mut model, 0., &scoring, &kernel, &mut rng)
            .unwrap();
        assert_eq!(sampler.control_points().unwrap().len(), 3);

        model.times = (0..30).map(|t| t as f64 * 0.5).collect();
        model.trajectories = vec![vec![0.; 30]];
        sampler.ensure_control_points(&model).unwrap();
        assert_eq!(sampler.control_points().unwrap().len(), 10);
        assert_eq!(sampler.sample_index(), 0);
    }

    #[test]
    fn singular_covariance_skips_move() {
        // Duplicate time points make the control covariance singular.
        let mut model = DriftModel::new(vec![1., 1., 1., 1.], 1);
        let scoring = FnScore(|_: &DriftModel| 0.);
        let kernel = crate::scoring::FnKernel(|_: usize, _: f64, _: f64| 1.);
        let mut sampler = DriftSampler::new(DriftSettings {
            target_spacing: 1,
            cholesky: CholeskySettings {
                jitter: 0.,
                jitter_growth: 1.,
                max_attempts: 1,
            },
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let step = sampler
            .step(&mut model, -1., &scoring, &kernel, &mut rng)
            .unwrap();
        assert!(step.skipped);
        assert_eq!(step.log_posterior, -1.);
        assert_eq!(model.trajectories[0], vec![0.; 4]);
    }

    #[test]
    fn recorder_tracks_best_trajectory() {
        let times: Vec<f64> = (0..20).map(|t| t as f64).collect();
        let mut model = DriftModel::new(times, 1);
        let kernel = kernel();
        let scoring = FnScore(|model: &DriftModel| {
            model.trajectories[0]
                .iter()
                .map(|v| -0.5 * (v - 1.) * (v - 1.))
                .sum()
        });
        let mut sampler = DriftSampler::new(DriftSettings {
            target_spacing: 5,
            burn_in: 20,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut recorder = BestRecorder::new();

        let mut logp = (scoring.0)(&model);
        let initial = logp;
        for _ in 0..200 {
            logp = sampler
                .cycle(&mut model, logp, &scoring, &kernel, &mut rng)
                .unwrap()
                .log_posterior;
            if sampler.is_burned_in() {
                recorder.record(logp, &model);
            }
        }
        assert!(recorder.log_posterior() > initial);
        let best = recorder.best().unwrap();
        assert_eq!((scoring.0)(best), recorder.log_posterior());
        assert!(sampler.counts().rate() > 0.);
    }
}
