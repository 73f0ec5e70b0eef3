//! Collaborator interfaces supplied by the model author.
//!
//! The sampling core never looks inside priors, likelihoods, ODE solvers or
//! covariance kernels. It only calls these traits, and it shares every
//! implementation read-only between worker threads for the whole dispatch.

use rand::RngCore;

use crate::error::ScoreError;

/// Unnormalized log posterior of a unit model.
///
/// Must be pure for fixed hyperparameters. `f64::NEG_INFINITY` marks an
/// invalid state and is always rejected.
pub trait ScoringFunction<U>: Sync {
    fn log_posterior(&self, model: &U) -> Result<f64, ScoreError>;
}

/// Gradient of the log posterior with respect to all addressable parameters.
pub trait GradientEstimator<U>: Sync {
    fn gradient(&self, model: &U, out: &mut [f64]) -> Result<(), ScoreError>;
}

/// Optional Gibbs move over discrete cluster assignments.
pub trait ClusterStep<U>: Sync {
    fn step(
        &self,
        model: &mut U,
        log_target: &dyn ScoringFunction<U>,
        rng: &mut dyn RngCore,
    ) -> Result<(), ScoreError>;
}

/// Prior covariance of one time-varying coefficient between two times.
pub trait CovarianceKernel: Sync {
    fn covariance(&self, coefficient: usize, s: f64, t: f64) -> f64;
}

/// Scoring function backed by a closure.
pub struct FnScore<F>(pub F);

impl<U, F> ScoringFunction<U> for FnScore<F>
where
    F: Fn(&U) -> f64 + Sync,
{
    fn log_posterior(&self, model: &U) -> Result<f64, ScoreError> {
        Ok((self.0)(model))
    }
}

/// Gradient estimator backed by a closure.
pub struct FnGradient<F>(pub F);

impl<U, F> GradientEstimator<U> for FnGradient<F>
where
    F: Fn(&U, &mut [f64]) + Sync,
{
    fn gradient(&self, model: &U, out: &mut [f64]) -> Result<(), ScoreError> {
        (self.0)(model, out);
        Ok(())
    }
}

/// Covariance kernel backed by a closure.
pub struct FnKernel<F>(pub F);

impl<F> CovarianceKernel for FnKernel<F>
where
    F: Fn(usize, f64, f64) -> f64 + Sync,
{
    fn covariance(&self, coefficient: usize, s: f64, t: f64) -> f64 {
        (self.0)(coefficient, s, t)
    }
}

/// The collaborators one dispatch runs against.
pub struct Targets<'a, U> {
    pub scoring: &'a dyn ScoringFunction<U>,
    pub gradient: Option<&'a dyn GradientEstimator<U>>,
    pub cluster: Option<&'a dyn ClusterStep<U>>,
    pub kernel: Option<&'a dyn CovarianceKernel>,
}

impl<'a, U> Clone for Targets<'a, U> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, U> Copy for Targets<'a, U> {}

impl<'a, U> Targets<'a, U> {
    pub fn new(scoring: &'a dyn ScoringFunction<U>) -> Self {
        Self {
            scoring,
            gradient: None,
            cluster: None,
            kernel: None,
        }
    }

    pub fn with_gradient(mut self, gradient: &'a dyn GradientEstimator<U>) -> Self {
        self.gradient = Some(gradient);
        self
    }

    pub fn with_cluster_step(mut self, cluster: &'a dyn ClusterStep<U>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_kernel(mut self, kernel: &'a dyn CovarianceKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }
}
