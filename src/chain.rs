//! The per-unit worker loop.
//!
//! A unit's chain composes the optional cluster move, one transition kernel
//! (MH sweep, HMC or drift cycle), diagnostics, proposal-scale adaptation and
//! the convergence check. Everything a chain needs between dispatches lives
//! in its [`UnitSlot`], which is owned by exactly one worker at a time.

use std::path::PathBuf;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::{
    convergence::{ConvergenceMonitor, ConvergenceSettings},
    diagnostics::UnitLogs,
    drift::{DriftSampler, DriftSettings},
    error::{UnitError, UnitFailure},
    hamiltonian::{HmcSampler, HmcSettings},
    metropolis::{metropolis_sweep, score_candidate, AcceptanceCounts},
    model::UnitModel,
    proposal::{Proposal, ProposalSettings},
    recorder::BestRecorder,
    scale_adapt::{ScaleAdaptSettings, ScaleAdapter},
    scoring::Targets,
    storage::{ArrowDrawStorage, DrawStorage},
};

/// What a chain is run for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Hunt for a local maximum. Stops on convergence and leaves the unit
    /// at the best state seen.
    Optimize,
    /// Draw posterior samples after a fixed burn-in.
    Sample,
}

/// Transition kernel of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Metropolis,
    Hamiltonian,
    /// Drift cycle over the time-varying coefficients followed by an MH
    /// sweep over the static parameters.
    Drift,
}

#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub mode: RunMode,
    pub step: StepKind,
    /// Iterations per dispatch.
    pub max_iters: u64,
    /// Iterations before samples are recorded and HMC stops tuning.
    pub burn_in: u64,
    /// Write the text logs every this many iterations. Zero disables them.
    pub log_interval: u64,
    /// Record a sample every this many iterations in sample mode. Zero
    /// disables sample recording.
    pub sample_interval: u64,
    /// Also keep recorded samples in memory as an Arrow array.
    pub store_draws: bool,
    /// Write the best state to `best_state.txt` when the unit finishes.
    pub write_best_state: bool,
    /// Decimal places in the text logs.
    pub precision: usize,
    pub proposal: ProposalSettings,
    pub scale_adapt: ScaleAdaptSettings,
    pub convergence: ConvergenceSettings,
    pub hmc: HmcSettings,
    pub drift: DriftSettings,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            mode: RunMode::Optimize,
            step: StepKind::Metropolis,
            max_iters: 1000,
            burn_in: 0,
            log_interval: 100,
            sample_interval: 0,
            store_draws: false,
            write_best_state: false,
            precision: 6,
            proposal: ProposalSettings::default(),
            scale_adapt: ScaleAdaptSettings::default(),
            convergence: ConvergenceSettings::default(),
            hmc: HmcSettings::default(),
            drift: DriftSettings::default(),
        }
    }
}

/// Bookkeeping of one unit's chain that survives between dispatches.
#[derive(Debug, Clone, Default)]
pub struct ChainRecord {
    /// Iterations over all dispatches.
    pub iteration: u64,
    pub counts: AcceptanceCounts,
    pub log_posterior: f64,
    pub best_log_posterior: f64,
    /// Proposal scale per coordinate, reused by the next dispatch.
    pub scales: Vec<f64>,
    pub burned_in: bool,
    adapter: Option<ScaleAdapter>,
}

impl ChainRecord {
    /// Completed adaptation batches.
    pub fn adapt_batch(&self) -> u64 {
        self.adapter.as_ref().map(|a| a.batch()).unwrap_or(0)
    }

    /// Clear acceptance counters while keeping the tuned scales.
    pub fn reset_counters(&mut self) {
        self.counts.reset();
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.restart_batch(&self.counts);
        }
    }
}

/// Everything the dispatcher keeps for one unit.
pub struct UnitSlot<U> {
    pub model: U,
    /// Directory of the unit's text logs. `None` disables them.
    pub output_dir: Option<PathBuf>,
    pub record: ChainRecord,
    pub best: BestRecorder<U>,
    pub draws: Option<ArrowDrawStorage>,
    hmc: Option<HmcSampler>,
    drift: Option<DriftSampler>,
}

impl<U: UnitModel> UnitSlot<U> {
    pub fn new(model: U) -> Self {
        Self {
            model,
            output_dir: None,
            record: ChainRecord {
                log_posterior: f64::NEG_INFINITY,
                best_log_posterior: f64::NEG_INFINITY,
                ..Default::default()
            },
            best: BestRecorder::new(),
            draws: None,
            hmc: None,
            drift: None,
        }
    }

    pub fn with_output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn drift_sampler(&self) -> Option<&DriftSampler> {
        self.drift.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    TimeExceeded,
    /// Ran `max_iters` iterations.
    Exhausted,
    Failed,
}

/// Summary of one unit's run in one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit: usize,
    pub iterations: u64,
    pub stop: StopReason,
    /// The time budget ran out before the chain finished.
    pub exceeded: bool,
    pub best_log_posterior: f64,
    pub log_posterior: f64,
    pub acceptance_rate: f64,
}

impl UnitOutcome {
    pub(crate) fn failed(unit: usize, iterations: u64, record: &ChainRecord) -> Self {
        Self {
            unit,
            iterations,
            stop: StopReason::Failed,
            exceeded: false,
            best_log_posterior: record.best_log_posterior,
            log_posterior: record.log_posterior,
            acceptance_rate: record.counts.rate(),
        }
    }
}

/// Random number generator of one unit in one dispatch.
///
/// Depends only on the seed, the dispatch epoch and the unit index, so
/// results do not depend on how units are spread over threads. Seed and
/// epoch occupy separate words of the key, the unit selects the stream.
pub fn unit_rng(seed: u64, epoch: u64, unit: usize) -> ChaCha8Rng {
    let mut key = <ChaCha8Rng as SeedableRng>::Seed::default();
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..16].copy_from_slice(&epoch.to_le_bytes());
    let mut rng = ChaCha8Rng::from_seed(key);
    rng.set_stream(unit as u64);
    rng
}

fn time_is_up(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn diagnostics(err: anyhow::Error) -> UnitFailure {
    UnitFailure::Diagnostics(err)
}

/// Run one unit's chain for up to `settings.max_iters` iterations.
///
/// On a failure the model stays at its last valid state and the error names
/// the iteration it happened in.
pub fn run_unit<U: UnitModel, R: Rng>(
    unit: usize,
    slot: &mut UnitSlot<U>,
    mut logs: Option<&mut UnitLogs>,
    settings: &ChainSettings,
    targets: Targets<'_, U>,
    rng: &mut R,
    deadline: Option<Instant>,
) -> Result<UnitOutcome, UnitError> {
    let mut iteration = 0;
    let result = run_iterations(
        unit,
        slot,
        logs.as_deref_mut(),
        settings,
        targets,
        rng,
        deadline,
        &mut iteration,
    );
    if let Some(logs) = logs {
        if let Err(err) = logs.flush() {
            warn!(unit, error = %err, "could not flush diagnostic logs");
        }
    }
    result.map_err(|source| UnitError {
        unit,
        iteration,
        source,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_iterations<U: UnitModel, R: Rng>(
    unit: usize,
    slot: &mut UnitSlot<U>,
    mut logs: Option<&mut UnitLogs>,
    settings: &ChainSettings,
    targets: Targets<'_, U>,
    rng: &mut R,
    deadline: Option<Instant>,
    iteration: &mut u64,
) -> Result<UnitOutcome, UnitFailure> {
    let outcome = |record: &ChainRecord, iterations, stop, exceeded, rate| UnitOutcome {
        unit,
        iterations,
        stop,
        exceeded,
        best_log_posterior: record.best_log_posterior,
        log_posterior: record.log_posterior,
        acceptance_rate: rate,
    };

    if time_is_up(deadline) {
        let rate = slot.record.counts.rate();
        return Ok(outcome(&slot.record, 0, StopReason::TimeExceeded, true, rate));
    }

    let UnitSlot {
        model,
        record,
        best,
        draws,
        hmc,
        drift,
        ..
    } = slot;

    let mut proposal = Proposal::new(model, &settings.proposal).with_scales(&record.scales);
    let num_counters = match settings.step {
        StepKind::Hamiltonian => 1,
        _ => proposal.len(),
    };
    if record.counts.proposed.len() != num_counters {
        record.counts = AcceptanceCounts::new(num_counters);
        record.adapter = None;
    }
    let adapter = record
        .adapter
        .get_or_insert_with(|| ScaleAdapter::new(settings.scale_adapt, num_counters));

    match settings.step {
        StepKind::Metropolis => {}
        StepKind::Hamiltonian => {
            if targets.gradient.is_none() {
                return Err(UnitFailure::Config(
                    "hamiltonian steps need a gradient estimator".into(),
                ));
            }
            if hmc.is_none() {
                let indices = (0..proposal.len()).map(|c| proposal.model_index(c)).collect();
                *hmc = Some(HmcSampler::new(settings.hmc, indices, model.num_params()));
            }
        }
        StepKind::Drift => {
            if targets.kernel.is_none() {
                return Err(UnitFailure::Config(
                    "drift steps need a covariance kernel".into(),
                ));
            }
            drift
                .get_or_insert_with(|| DriftSampler::new(settings.drift))
                .ensure_control_points(model)?;
        }
    }
    if settings.store_draws && draws.is_none() {
        *draws = Some(ArrowDrawStorage::new(model.num_params()));
    }

    let mut monitor = ConvergenceMonitor::new(settings.convergence);
    let mut logp = score_candidate(targets.scoring, model)?;
    monitor.observe(logp);
    best.record(logp, model);
    record.log_posterior = logp;
    record.best_log_posterior = best.log_posterior();

    let mut stop = StopReason::Exhausted;
    let mut exceeded = false;
    while *iteration < settings.max_iters {
        if time_is_up(deadline) {
            stop = StopReason::TimeExceeded;
            exceeded = true;
            break;
        }
        let i = *iteration + 1;
        let total = record.iteration + 1;
        let burned_in = record.burned_in
            || (total > settings.burn_in
                && drift
                    .as_ref()
                    .map(|sampler| sampler.is_burned_in())
                    .unwrap_or(true));

        if let Some(cluster) = targets.cluster {
            let before = model.clone();
            let moved = cluster
                .step(model, targets.scoring, rng)
                .and_then(|()| score_candidate(targets.scoring, model));
            match moved {
                Ok(moved_logp) => logp = moved_logp,
                Err(err) => {
                    *model = before;
                    model.invalidate_caches();
                    return Err(err.into());
                }
            }
        }

        match settings.step {
            StepKind::Metropolis => {
                logp = metropolis_sweep(
                    model,
                    logp,
                    &mut proposal,
                    targets.scoring,
                    &mut record.counts,
                    rng,
                )?
                .log_posterior;
            }
            StepKind::Hamiltonian => {
                if let (Some(sampler), Some(gradient)) = (hmc.as_mut(), targets.gradient) {
                    let step =
                        sampler.step(model, logp, targets.scoring, gradient, !burned_in, rng)?;
                    record.counts.register(0, step.accepted);
                    logp = step.log_posterior;
                }
            }
            StepKind::Drift => {
                if let (Some(sampler), Some(kernel)) = (drift.as_mut(), targets.kernel) {
                    logp = sampler
                        .cycle(model, logp, targets.scoring, kernel, rng)?
                        .log_posterior;
                }
                logp = metropolis_sweep(
                    model,
                    logp,
                    &mut proposal,
                    targets.scoring,
                    &mut record.counts,
                    rng,
                )?
                .log_posterior;
            }
        }

        *iteration = i;
        record.iteration = total;
        record.burned_in = burned_in;
        record.log_posterior = logp;
        monitor.observe(logp);
        best.record(logp, model);
        record.best_log_posterior = best.log_posterior();

        if let Some(logs) = logs.as_deref_mut() {
            if settings.log_interval > 0 && total % settings.log_interval == 0 {
                logs.log_posterior(record.iteration, logp, record.best_log_posterior)
                    .map_err(diagnostics)?;
                logs.trace(record.iteration, &record.counts)
                    .map_err(diagnostics)?;
                logs.acceptance(record.iteration, &record.counts)
                    .map_err(diagnostics)?;
                logs.scales(record.iteration, proposal.scales())
                    .map_err(diagnostics)?;
            }
        }

        let record_sample = settings.mode == RunMode::Sample
            && burned_in
            && settings.sample_interval > 0
            && total % settings.sample_interval == 0;
        if record_sample {
            let params = model.params();
            if let Some(logs) = logs.as_deref_mut() {
                logs.sample(record.iteration, &params).map_err(diagnostics)?;
            }
            if let Some(draws) = draws.as_mut() {
                draws
                    .append_value(record.iteration, logp, &params)
                    .map_err(diagnostics)?;
            }
        }

        if settings.step != StepKind::Hamiltonian {
            adapter.end_iteration(i, &record.counts, &mut proposal);
        }

        if settings.mode == RunMode::Optimize && monitor.check(i) {
            stop = StopReason::Converged;
            break;
        }
    }
    record.scales = proposal.scales().to_vec();
    let rate = match (settings.step, drift.as_ref()) {
        (StepKind::Drift, Some(sampler)) => sampler.counts().rate(),
        _ => record.counts.rate(),
    };

    if settings.mode == RunMode::Optimize {
        if stop != StopReason::Converged {
            warn!(
                unit,
                iterations = *iteration,
                best = record.best_log_posterior,
                "chain did not converge within its budget"
            );
        }
        if let Some((best_logp, best_state)) = best.take() {
            *model = best_state;
            record.log_posterior = best_logp;
            best.record(best_logp, model);
        }
        record.reset_counters();
    }

    if settings.write_best_state {
        if let Some(logs) = logs.as_deref_mut() {
            let path = logs.best_state_path();
            let state = best.best().unwrap_or(&*model);
            state.write(&path).map_err(diagnostics)?;
        }
    }

    debug!(
        unit,
        iterations = *iteration,
        stop = ?stop,
        log_posterior = record.log_posterior,
        "unit finished"
    );
    Ok(outcome(&*record, *iteration, stop, exceeded, rate))
}

/// Run a contiguous block of units, one after another.
///
/// `first_unit` is the global index of `slots[0]`. A failing unit does not
/// stop the remaining units of the block.
#[allow(clippy::too_many_arguments)]
pub fn run_partition<U: UnitModel>(
    first_unit: usize,
    slots: &mut [UnitSlot<U>],
    logs: &mut [Option<UnitLogs>],
    settings: &ChainSettings,
    targets: Targets<'_, U>,
    seed: u64,
    epoch: u64,
    deadline: Option<Instant>,
) -> Vec<(usize, Result<UnitOutcome, UnitError>)> {
    slots
        .iter_mut()
        .zip(logs.iter_mut())
        .enumerate()
        .map(|(offset, (slot, unit_logs))| {
            let unit = first_unit + offset;
            let mut rng = unit_rng(seed, epoch, unit);
            let result = run_unit(
                unit,
                slot,
                unit_logs.as_mut(),
                settings,
                targets,
                &mut rng,
                deadline,
            );
            if let Err(err) = &result {
                warn!(unit, iteration = err.iteration, error = %err.source, "unit chain failed");
            }
            (unit, result)
        })
        .collect()
}
