//! In-memory storage of posterior samples as Arrow arrays.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::{
    array::{
        Array, ArrayBuilder, ArrayRef, FixedSizeListBuilder, Float64Builder, PrimitiveBuilder,
        StructArray, UInt64Builder,
    },
    datatypes::{Field, Fields, Float64Type},
};

/// Destination for the draws recorded by one unit's chain.
pub trait DrawStorage: Send {
    fn append_value(&mut self, iteration: u64, log_posterior: f64, point: &[f64]) -> Result<()>;
    fn finalize(self) -> Result<Arc<dyn Array>>;
    fn inspect(&self) -> Result<Arc<dyn Array>>;
}

/// Draws as a struct array with columns `iteration`, `log_posterior` and
/// `draw` (a fixed size list of the parameter vector).
pub struct ArrowDrawStorage {
    dim: usize,
    iteration: UInt64Builder,
    log_posterior: Float64Builder,
    draws: FixedSizeListBuilder<PrimitiveBuilder<Float64Type>>,
}

impl ArrowDrawStorage {
    pub fn new(dim: usize) -> Self {
        let items = PrimitiveBuilder::new();
        let draws = FixedSizeListBuilder::new(items, dim as _);
        Self {
            dim,
            iteration: UInt64Builder::new(),
            log_posterior: Float64Builder::new(),
            draws,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.iteration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn assemble(columns: [ArrayRef; 3]) -> Result<Arc<dyn Array>> {
        let fields: Fields = ["iteration", "log_posterior", "draw"]
            .iter()
            .zip(&columns)
            .map(|(name, col)| Field::new(*name, col.data_type().clone(), false))
            .collect();
        let array = StructArray::try_new(fields, columns.to_vec(), None)
            .context("Could not assemble draw array")?;
        Ok(Arc::new(array))
    }
}

impl DrawStorage for ArrowDrawStorage {
    fn append_value(&mut self, iteration: u64, log_posterior: f64, point: &[f64]) -> Result<()> {
        if point.len() != self.dim {
            bail!(
                "Draw has {} values but storage expects {}",
                point.len(),
                self.dim
            );
        }
        self.iteration.append_value(iteration);
        self.log_posterior.append_value(log_posterior);
        self.draws.values().append_slice(point);
        self.draws.append(true);
        Ok(())
    }

    fn finalize(mut self) -> Result<Arc<dyn Array>> {
        Self::assemble([
            ArrayBuilder::finish(&mut self.iteration),
            ArrayBuilder::finish(&mut self.log_posterior),
            ArrayBuilder::finish(&mut self.draws),
        ])
    }

    fn inspect(&self) -> Result<Arc<dyn Array>> {
        Self::assemble([
            ArrayBuilder::finish_cloned(&self.iteration),
            ArrayBuilder::finish_cloned(&self.log_posterior),
            ArrayBuilder::finish_cloned(&self.draws),
        ])
    }
}
