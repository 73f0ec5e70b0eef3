//! Per-unit plain-text diagnostic logs.
//!
//! Every unit writes into its own directory, so no two workers ever touch the
//! same file. Files are opened in append mode: a later dispatch over the same
//! units continues the existing logs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::metropolis::AcceptanceCounts;

pub const LOG_POSTERIOR_FILE: &str = "ll.txt";
pub const TRACE_FILE: &str = "trace.txt";
pub const ACCEPTANCE_FILE: &str = "acceptance.txt";
pub const SCALES_FILE: &str = "pos.txt";
pub const SAMPLE_FILE: &str = "sample_log.txt";
pub const BEST_STATE_FILE: &str = "best_state.txt";

fn open_append(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open diagnostic log: {:?}", path))?;
    Ok(BufWriter::new(file))
}

/// Open log files of one unit.
pub struct UnitLogs {
    dir: PathBuf,
    precision: usize,
    log_posterior: BufWriter<File>,
    trace: BufWriter<File>,
    acceptance: BufWriter<File>,
    scales: BufWriter<File>,
    samples: BufWriter<File>,
}

impl UnitLogs {
    /// Create the unit directory if needed and open all logs.
    pub fn open<P: AsRef<Path>>(dir: P, precision: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
        Ok(Self {
            log_posterior: open_append(&dir, LOG_POSTERIOR_FILE)?,
            trace: open_append(&dir, TRACE_FILE)?,
            acceptance: open_append(&dir, ACCEPTANCE_FILE)?,
            scales: open_append(&dir, SCALES_FILE)?,
            samples: open_append(&dir, SAMPLE_FILE)?,
            precision,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_row(
        writer: &mut BufWriter<File>,
        precision: usize,
        iteration: u64,
        values: impl IntoIterator<Item = f64>,
    ) -> Result<()> {
        write!(writer, "{}", iteration)?;
        for value in values {
            write!(writer, " {:.*}", precision, value)?;
        }
        writeln!(writer)?;
        Ok(())
    }

    /// `iteration current best` into `ll.txt`.
    pub fn log_posterior(&mut self, iteration: u64, current: f64, best: f64) -> Result<()> {
        Self::write_row(
            &mut self.log_posterior,
            self.precision,
            iteration,
            [current, best],
        )
        .context("Failed to write log posterior")
    }

    /// Running accepted and proposed totals into `trace.txt`.
    pub fn trace(&mut self, iteration: u64, counts: &AcceptanceCounts) -> Result<()> {
        let accepted: u64 = counts.accepted.iter().sum();
        let proposed: u64 = counts.proposed.iter().sum();
        writeln!(self.trace, "{} {} {}", iteration, accepted, proposed)
            .context("Failed to write trace")
    }

    pub fn acceptance(&mut self, iteration: u64, counts: &AcceptanceCounts) -> Result<()> {
        let rates = (0..counts.proposed.len()).map(|idx| counts.coordinate_rate(idx));
        Self::write_row(&mut self.acceptance, 4, iteration, rates)
            .context("Failed to write acceptance rates")
    }

    pub fn scales(&mut self, iteration: u64, scales: &[f64]) -> Result<()> {
        Self::write_row(
            &mut self.scales,
            self.precision,
            iteration,
            scales.iter().copied(),
        )
        .context("Failed to write proposal scales")
    }

    pub fn sample(&mut self, iteration: u64, values: &[f64]) -> Result<()> {
        Self::write_row(
            &mut self.samples,
            self.precision,
            iteration,
            values.iter().copied(),
        )
        .context("Failed to write sample")
    }

    pub fn best_state_path(&self) -> PathBuf {
        self.dir.join(BEST_STATE_FILE)
    }

    pub fn flush(&mut self) -> Result<()> {
        for writer in [
            &mut self.log_posterior,
            &mut self.trace,
            &mut self.acceptance,
            &mut self.scales,
            &mut self.samples,
        ] {
            writer.flush().context("Failed to flush diagnostic log")?;
        }
        Ok(())
    }
}

impl Drop for UnitLogs {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
