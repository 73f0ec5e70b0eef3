//! Fit many independent per-unit models with adaptive MCMC chains.
//!
//! Every unit gets its own chain (Metropolis-Hastings, HMC or a Gaussian
//! process drift sampler). A [`Dispatcher`] spreads the units over a bounded
//! thread pool, enforces a shared wall-clock budget and reports per-unit
//! failures only after all workers have finished.

pub(crate) mod chain;
pub(crate) mod convergence;
pub(crate) mod diagnostics;
pub(crate) mod drift;
pub(crate) mod error;
pub(crate) mod gp;
pub(crate) mod hamiltonian;
pub(crate) mod math;
pub(crate) mod metropolis;
pub(crate) mod model;
pub(crate) mod proposal;
pub(crate) mod recorder;
pub(crate) mod sampler;
pub(crate) mod scale_adapt;
pub(crate) mod scoring;
pub(crate) mod stepsize;
pub(crate) mod storage;

pub use chain::{
    run_partition, run_unit, unit_rng, ChainRecord, ChainSettings, RunMode, StepKind, StopReason,
    UnitOutcome, UnitSlot,
};
pub use convergence::{ConvergenceMonitor, ConvergenceSettings};
pub use diagnostics::UnitLogs;
pub use drift::{ControlPointSet, DriftCycle, DriftSampler, DriftSettings, DriftStep};
pub use error::{DispatchError, GpError, ProposalError, ScoreError, UnitError, UnitFailure};
pub use gp::{
    kernel_matrix, CholeskySettings, ConditionalWeights, Factor, Predictive, TrajectoryConditional,
};
pub use hamiltonian::{HmcInfo, HmcSampler, HmcSettings};
pub use metropolis::{accept_move, metropolis_step, metropolis_sweep, AcceptanceCounts, StepOutcome};
pub use model::{ParamBlock, ParamSubset, UnitModel};
pub use proposal::{Candidate, Proposal, ProposalSettings};
pub use recorder::BestRecorder;
pub use sampler::{clamp_threads, partition, DispatchSummary, Dispatcher, SamplerSettings};
pub use scale_adapt::{ScaleAdaptSettings, ScaleAdapter};
pub use scoring::{
    ClusterStep, CovarianceKernel, FnGradient, FnKernel, FnScore, GradientEstimator,
    ScoringFunction, Targets,
};
pub use stepsize::{DualAverage, DualAverageOptions};
pub use storage::{ArrowDrawStorage, DrawStorage};
