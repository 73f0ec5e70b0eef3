//! The per-unit model state surface consumed by the samplers.
//!
//! The model owns the parameter vector of one unit (one observed subject or
//! pair) together with whatever caches its scoring function needs. The
//! sampling core only reads and writes parameters by index, so the
//! mathematical structure of the model stays outside of this crate.

use std::path::Path;

use anyhow::{Context, Result};
use itertools::Itertools;

/// Addressable parameter blocks of a unit model.
///
/// Flat parameter indices are laid out block by block in the order
/// `Dynamics`, `InitialState`, `Polynomial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamBlock {
    /// Coefficients of the dynamical system.
    Dynamics,
    /// Initial state of the dynamical system.
    InitialState,
    /// Polynomial observation terms.
    Polynomial,
}

impl ParamBlock {
    pub const ALL: [ParamBlock; 3] = [
        ParamBlock::Dynamics,
        ParamBlock::InitialState,
        ParamBlock::Polynomial,
    ];
}

/// The set of blocks a chain is allowed to perturb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSubset {
    pub dynamics: bool,
    pub initial_state: bool,
    pub polynomial: bool,
}

impl Default for ParamSubset {
    fn default() -> Self {
        Self {
            dynamics: true,
            initial_state: true,
            polynomial: true,
        }
    }
}

impl ParamSubset {
    pub fn contains(&self, block: ParamBlock) -> bool {
        match block {
            ParamBlock::Dynamics => self.dynamics,
            ParamBlock::InitialState => self.initial_state,
            ParamBlock::Polynomial => self.polynomial,
        }
    }

    /// Flat model indices covered by this subset, paired with their block.
    pub fn coordinates<U: UnitModel + ?Sized>(&self, model: &U) -> Vec<(usize, ParamBlock)> {
        let mut offset = 0;
        let mut coords = Vec::new();
        for block in ParamBlock::ALL {
            let count = model.num_params_in(block);
            if self.contains(block) {
                coords.extend((offset..offset + count).map(|idx| (idx, block)));
            }
            offset += count;
        }
        coords
    }
}

/// State of one unit.
///
/// Implementations must be cheap enough to clone: the best state seen by a
/// chain is kept as a full snapshot.
pub trait UnitModel: Clone + Send {
    /// Number of parameters in one block.
    fn num_params_in(&self, block: ParamBlock) -> usize;

    /// Total number of addressable parameters.
    fn num_params(&self) -> usize {
        ParamBlock::ALL
            .iter()
            .map(|&block| self.num_params_in(block))
            .sum()
    }

    fn param(&self, index: usize) -> f64;

    fn set_param(&mut self, index: usize, value: f64);

    /// Support of a parameter. Proposals never leave it.
    fn param_bounds(&self, _index: usize) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Observation times of this unit.
    fn times(&self) -> &[f64];

    /// Number of time-varying coefficients sampled by the drift sampler.
    fn num_drift_coefficients(&self) -> usize {
        0
    }

    /// Per-time-step values of a time-varying coefficient.
    fn trajectory(&self, _coefficient: usize) -> &[f64] {
        &[]
    }

    fn set_trajectory(&mut self, _coefficient: usize, _values: &[f64]) {}

    /// Mark derived caches stale after parameters or trajectories changed.
    fn invalidate_caches(&mut self) {}

    /// Copy all addressable parameters into a vector.
    fn params(&self) -> Vec<f64> {
        (0..self.num_params()).map(|idx| self.param(idx)).collect()
    }

    /// Write the state as whitespace separated text.
    fn write(&self, path: &Path) -> Result<()> {
        let mut text = self.params().iter().join(" ");
        text.push('\n');
        for coefficient in 0..self.num_drift_coefficients() {
            text.push_str(&self.trajectory(coefficient).iter().join(" "));
            text.push('\n');
        }
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write model state to {:?}", path))
    }
}
