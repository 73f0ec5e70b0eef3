//! Spread units over a bounded pool of worker threads.

use std::ops::Range;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use tracing::info;

use crate::{
    chain::{run_partition, ChainSettings, StopReason, UnitOutcome, UnitSlot},
    diagnostics::UnitLogs,
    error::DispatchError,
    model::UnitModel,
    scoring::Targets,
};

/// Settings of a [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    /// Requested worker threads. Zero uses all available cores.
    pub num_threads: usize,
    pub seed: u64,
    /// Wall-clock budget shared by all dispatches of this dispatcher.
    pub max_seconds: Option<f64>,
    pub chain: ChainSettings,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_threads: 0,
            seed: 0,
            max_seconds: None,
            chain: ChainSettings::default(),
        }
    }
}

/// Number of worker threads for `num_units` units: never more than
/// requested, than the machine has cores, or than there are units.
pub fn clamp_threads(requested: usize, num_units: usize) -> usize {
    if num_units == 0 {
        return 0;
    }
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let requested = if requested == 0 { available } else { requested };
    requested.min(available).min(num_units).max(1)
}

/// Split `[0, num_units)` into `threads` contiguous ranges of equal length.
/// The last range absorbs the remainder.
pub fn partition(num_units: usize, threads: usize) -> Vec<Range<usize>> {
    if num_units == 0 {
        return Vec::new();
    }
    let threads = threads.clamp(1, num_units);
    let chunk = num_units / threads;
    (0..threads)
        .map(|i| {
            let end = if i + 1 == threads {
                num_units
            } else {
                (i + 1) * chunk
            };
            i * chunk..end
        })
        .collect()
}

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSummary {
    /// One entry per unit, ordered by unit index.
    pub outcomes: Vec<UnitOutcome>,
    pub threads: usize,
    pub elapsed: Duration,
    /// Budget left for later dispatches.
    pub remaining: Option<Duration>,
}

impl DispatchSummary {
    pub fn num_failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.stop == StopReason::Failed)
            .count()
    }

    pub fn num_exceeded(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.exceeded).count()
    }

    pub fn all_converged(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.stop == StopReason::Converged)
    }
}

/// Runs the chains of many units in parallel and keeps track of the
/// remaining time budget between dispatches.
pub struct Dispatcher {
    settings: SamplerSettings,
    remaining: Option<Duration>,
    epoch: u64,
}

impl Dispatcher {
    pub fn new(settings: SamplerSettings) -> Self {
        let remaining = settings
            .max_seconds
            .map(|secs| Duration::try_from_secs_f64(secs.max(0.)).unwrap_or(Duration::MAX));
        Self {
            settings,
            remaining,
            epoch: 0,
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Number of dispatches run so far. Mixed into the unit seeds so that
    /// repeated dispatches draw fresh random numbers.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Run every unit's chain once.
    ///
    /// Diagnostic logs are opened before any worker starts. Unit failures
    /// are collected and the first one is returned after all workers have
    /// finished, together with the outcomes of all units.
    pub fn dispatch<U: UnitModel>(
        &mut self,
        slots: &mut [UnitSlot<U>],
        targets: Targets<'_, U>,
    ) -> Result<DispatchSummary, DispatchError> {
        let num_units = slots.len();
        let chain = self.settings.chain;

        let mut logs: Vec<Option<UnitLogs>> = slots
            .iter()
            .enumerate()
            .map(|(unit, slot)| {
                slot.output_dir
                    .as_ref()
                    .map(|dir| UnitLogs::open(dir, chain.precision))
                    .transpose()
                    .map_err(|source| DispatchError::Diagnostics { unit, source })
            })
            .collect::<Result<_, _>>()?;

        let threads = clamp_threads(self.settings.num_threads, num_units);
        let ranges = partition(num_units, threads);
        let start = Instant::now();
        let deadline = self.remaining.and_then(|budget| start.checked_add(budget));
        info!(
            units = num_units,
            threads,
            epoch = self.epoch,
            budget = ?self.remaining,
            "dispatching units"
        );

        let mut results = Vec::with_capacity(num_units);
        if !ranges.is_empty() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("unitfit-worker-{}", i))
                .build()?;

            let (results_tx, results_rx) = channel();
            let seed = self.settings.seed;
            let epoch = self.epoch;
            let chain = &chain;

            pool.scope(|scope| {
                let mut rest_slots = &mut slots[..];
                let mut rest_logs = &mut logs[..];
                for range in ranges.iter() {
                    let (slots, tail) = std::mem::take(&mut rest_slots).split_at_mut(range.len());
                    let (logs, logs_tail) =
                        std::mem::take(&mut rest_logs).split_at_mut(range.len());
                    rest_slots = tail;
                    rest_logs = logs_tail;

                    let results_tx = results_tx.clone();
                    let first = range.start;
                    scope.spawn(move |_| {
                        let results = run_partition(
                            first, slots, logs, chain, targets, seed, epoch, deadline,
                        );
                        // The receiver outlives the scope.
                        let _ = results_tx.send(results);
                    });
                }
            });
            drop(results_tx);
            results.extend(results_rx.into_iter().flatten());
        }
        // Close all logs before reporting.
        drop(logs);

        let elapsed = start.elapsed();
        self.remaining = self
            .remaining
            .map(|budget| budget.saturating_sub(elapsed));
        self.epoch += 1;

        results.sort_by_key(|(unit, _)| *unit);
        let mut failures = Vec::new();
        let outcomes = results
            .into_iter()
            .map(|(unit, result)| match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = UnitOutcome::failed(unit, err.iteration, &slots[unit].record);
                    failures.push(err);
                    outcome
                }
            })
            .collect_vec();

        let summary = DispatchSummary {
            outcomes,
            threads,
            elapsed,
            remaining: self.remaining,
        };
        info!(
            units = num_units,
            failed = failures.len(),
            exceeded = summary.num_exceeded(),
            elapsed = ?elapsed,
            "dispatch finished"
        );

        let failed = failures.len();
        match failures.into_iter().next() {
            Some(first) => Err(DispatchError::UnitFailed {
                failed,
                total: num_units,
                first,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}
