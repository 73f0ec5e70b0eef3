use thiserror::Error;

use crate::sampler::DispatchSummary;

/// Errors returned by the scoring function and the other collaborators.
///
/// Recoverable errors are numerical hiccups at one candidate (for example a
/// failed solve inside the likelihood) and are treated as rejected moves.
/// Everything else stops the chain of the unit that produced it.
#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("recoverable numerical failure: {0}")]
    Numerical(String),
    #[error("scoring failed: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl ScoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ScoreError::Numerical(_))
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProposalError {
    #[error("no in-bounds candidate for coordinate {coordinate} after {tries} tries")]
    ExhaustedRetries { coordinate: usize, tries: usize },
    #[error("proposal produced a non-finite candidate for coordinate {coordinate}")]
    NonFinite { coordinate: usize },
    #[error("proposal has no coordinates to perturb")]
    NoCoordinates,
    #[error("coordinate {coordinate} is out of range for a proposal over {len} coordinates")]
    OutOfRange { coordinate: usize, len: usize },
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpError {
    #[error("covariance matrix of size {size} is not positive definite after {attempts} jitter attempts")]
    NotPositiveDefinite { size: usize, attempts: usize },
    #[error("drift sampling needs at least 3 time points, got {0}")]
    TooFewTimePoints(usize),
    #[error("model exposes no time-varying coefficients")]
    NoCoefficients,
    #[error("trajectory of coefficient {coefficient} has {found} values, expected {expected}")]
    TrajectoryLength {
        coefficient: usize,
        expected: usize,
        found: usize,
    },
}

impl GpError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GpError::NotPositiveDefinite { .. })
    }
}

/// Failure of a single unit's chain. Siblings keep running.
#[derive(Error, Debug)]
#[error("unit {unit} failed at iteration {iteration}")]
pub struct UnitError {
    pub unit: usize,
    pub iteration: u64,
    #[source]
    pub source: UnitFailure,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum UnitFailure {
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error(transparent)]
    Gp(#[from] GpError),
    #[error("writing diagnostics failed")]
    Diagnostics(#[source] anyhow::Error),
    #[error("invalid chain configuration: {0}")]
    Config(String),
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("could not open diagnostic logs for unit {unit}")]
    Diagnostics {
        unit: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not start thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("{failed} of {total} units failed; first failure reported")]
    UnitFailed {
        failed: usize,
        total: usize,
        #[source]
        first: UnitError,
        /// Outcomes of every unit, failed ones included.
        summary: Box<DispatchSummary>,
    },
}
