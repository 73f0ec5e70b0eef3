//! Single-coordinate Metropolis-Hastings transitions.

use rand::Rng;
use tracing::trace;

use crate::{
    error::{ProposalError, ScoreError},
    model::UnitModel,
    proposal::Proposal,
    scoring::ScoringFunction,
};

/// Per-coordinate acceptance bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptanceCounts {
    pub accepted: Vec<u64>,
    pub proposed: Vec<u64>,
}

impl AcceptanceCounts {
    pub fn new(dim: usize) -> Self {
        Self {
            accepted: vec![0; dim],
            proposed: vec![0; dim],
        }
    }

    pub fn register(&mut self, coordinate: usize, accepted: bool) {
        self.proposed[coordinate] += 1;
        if accepted {
            self.accepted[coordinate] += 1;
        }
    }

    /// Fraction of accepted moves over all coordinates.
    pub fn rate(&self) -> f64 {
        let proposed: u64 = self.proposed.iter().sum();
        if proposed == 0 {
            return 0.;
        }
        self.accepted.iter().sum::<u64>() as f64 / proposed as f64
    }

    pub fn coordinate_rate(&self, coordinate: usize) -> f64 {
        match self.proposed[coordinate] {
            0 => 0.,
            n => self.accepted[coordinate] as f64 / n as f64,
        }
    }

    pub fn reset(&mut self) {
        self.accepted.iter_mut().for_each(|val| *val = 0);
        self.proposed.iter_mut().for_each(|val| *val = 0);
    }
}

/// Result of one transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub accepted: bool,
    /// Log posterior of the state after the transition.
    pub log_posterior: f64,
}

/// The shared accept rule: accept with probability
/// `min(1, exp(log_ratio))`. Non-finite or NaN ratios are rejects.
pub fn accept_move<R: Rng + ?Sized>(rng: &mut R, log_ratio: f64) -> bool {
    if log_ratio.is_nan() || log_ratio == f64::NEG_INFINITY {
        return false;
    }
    if log_ratio >= 0. {
        return true;
    }
    rng.random::<f64>().ln() < log_ratio
}

/// Score a candidate, turning recoverable failures into an invalid state.
pub(crate) fn score_candidate<U>(
    scoring: &dyn ScoringFunction<U>,
    model: &U,
) -> Result<f64, ScoreError> {
    match scoring.log_posterior(model) {
        Ok(logp) if logp.is_nan() => Ok(f64::NEG_INFINITY),
        Ok(logp) => Ok(logp),
        Err(err) if err.is_recoverable() => {
            trace!(error = %err, "recoverable scoring failure, rejecting");
            Ok(f64::NEG_INFINITY)
        }
        Err(err) => Err(err),
    }
}

/// One MH transition on the coordinate at `proposal.sample_index()`.
///
/// The model is left unchanged on rejection. Only a non-recoverable
/// scoring error is returned; the model is restored before returning it.
pub fn metropolis_step<U: UnitModel, R: Rng + ?Sized>(
    model: &mut U,
    current_logp: f64,
    proposal: &mut Proposal,
    scoring: &dyn ScoringFunction<U>,
    counts: &mut AcceptanceCounts,
    rng: &mut R,
) -> Result<StepOutcome, ScoreError> {
    let rejected = StepOutcome {
        accepted: false,
        log_posterior: current_logp,
    };

    let candidate = match proposal.propose(model, rng) {
        Ok(candidate) => candidate,
        Err(
            ProposalError::ExhaustedRetries { coordinate, .. }
            | ProposalError::NonFinite { coordinate },
        ) => {
            counts.register(coordinate, false);
            return Ok(rejected);
        }
        // Nothing to perturb.
        Err(ProposalError::NoCoordinates | ProposalError::OutOfRange { .. }) => {
            return Ok(rejected);
        }
    };

    let old = model.param(candidate.index);
    model.set_param(candidate.index, candidate.value);
    model.invalidate_caches();

    let new_logp = match score_candidate(scoring, model) {
        Ok(logp) => logp,
        Err(err) => {
            model.set_param(candidate.index, old);
            model.invalidate_caches();
            return Err(err);
        }
    };

    let log_ratio = new_logp - current_logp + candidate.log_bwd - candidate.log_fwd;
    let accepted = new_logp != f64::NEG_INFINITY && accept_move(rng, log_ratio);
    counts.register(candidate.coordinate, accepted);

    if accepted {
        Ok(StepOutcome {
            accepted,
            log_posterior: new_logp,
        })
    } else {
        model.set_param(candidate.index, old);
        model.invalidate_caches();
        Ok(rejected)
    }
}

/// One MH step per coordinate of the proposal.
pub fn metropolis_sweep<U: UnitModel, R: Rng + ?Sized>(
    model: &mut U,
    mut current_logp: f64,
    proposal: &mut Proposal,
    scoring: &dyn ScoringFunction<U>,
    counts: &mut AcceptanceCounts,
    rng: &mut R,
) -> Result<StepOutcome, ScoreError> {
    let mut any_accepted = false;
    for _ in 0..proposal.len() {
        let outcome = metropolis_step(model, current_logp, proposal, scoring, counts, rng)?;
        any_accepted |= outcome.accepted;
        current_logp = outcome.log_posterior;
    }
    Ok(StepOutcome {
        accepted: any_accepted,
        log_posterior: current_logp,
    })
}
