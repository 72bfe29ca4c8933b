//! Versioned snapshots of the whole sampler.
//!
//! A record holds everything needed to continue a run: the master seed,
//! the per-round sample moments of every chain together with the entries
//! not yet written out, rng positions and proposal covariances, and the
//! convergence history. Records are written as JSON through a temporary
//! file that is renamed over the previous checkpoint, so a crash while
//! writing leaves the old one intact.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainSnapshot, McmcChain};
use crate::convergence::{ConvergenceMonitor, ConvergenceRecord};
use crate::error::{McmcError, Result};
use crate::sampler::RunContext;

pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub master_seed: u64,
    /// Sampled parameters, in sampling order.
    pub parameters: Vec<String>,
    pub likelihoods: Vec<String>,
    pub num_chains: usize,
    /// Completed synchronization rounds.
    pub round: u64,
    /// Seconds spent sampling so far.
    pub elapsed: f64,
    pub converged: bool,
    pub chains: Vec<ChainSnapshot>,
    pub convergence_history: Vec<ConvergenceRecord>,
}

/// Mutable state of a run, owned by the sampler.
#[derive(Debug)]
pub struct SamplerState {
    pub master_seed: u64,
    pub round: u64,
    pub elapsed: Duration,
    pub converged: bool,
    pub chains: Vec<McmcChain>,
    pub monitor: ConvergenceMonitor,
}

/// Capture `state`. Must only be called while no chain is running.
pub fn save(state: &SamplerState, ctx: &RunContext) -> CheckpointRecord {
    CheckpointRecord {
        version: FORMAT_VERSION,
        master_seed: state.master_seed,
        parameters: ctx.space().sampled_names().map(str::to_string).collect(),
        likelihoods: ctx.posterior().likelihood_names().map(str::to_string).collect(),
        num_chains: state.chains.len(),
        round: state.round,
        elapsed: state.elapsed.as_secs_f64(),
        converged: state.converged,
        chains: state.chains.iter().map(McmcChain::snapshot).collect(),
        convergence_history: state.monitor.history().to_vec(),
    }
}

/// Rebuild the sampler state of a record for the run described by `ctx`.
pub fn restore(record: CheckpointRecord, ctx: &RunContext) -> Result<SamplerState> {
    let mismatch = |what: &str| {
        McmcError::CheckpointFormat(format!("{what} changed since the checkpoint was written"))
    };

    if record.version != FORMAT_VERSION {
        return Err(McmcError::CheckpointFormat(format!(
            "format version {} is not supported (expected {FORMAT_VERSION})",
            record.version
        )));
    }
    if !record.parameters.iter().map(String::as_str).eq(ctx.space().sampled_names()) {
        return Err(mismatch("the sampled parameters"));
    }
    if !record
        .likelihoods
        .iter()
        .map(String::as_str)
        .eq(ctx.posterior().likelihood_names())
    {
        return Err(mismatch("the likelihoods"));
    }
    let num_chains = ctx.settings().num_chains;
    if record.num_chains != num_chains || record.chains.len() != num_chains {
        return Err(mismatch("the number of chains"));
    }
    if !record.chains.iter().map(|c| c.id).eq(0..num_chains as u64) {
        return Err(McmcError::CheckpointFormat(
            "chains are missing or out of order".to_string(),
        ));
    }
    if !(record.elapsed >= 0. && record.elapsed.is_finite()) {
        return Err(McmcError::CheckpointFormat("invalid elapsed time".to_string()));
    }
    let steps = record.chains.iter().map(|c| c.stats.steps).all_equal();
    if !steps {
        return Err(McmcError::CheckpointFormat(
            "chains have different step counts".to_string(),
        ));
    }

    let chains = record
        .chains
        .into_iter()
        .map(|snapshot| McmcChain::from_snapshot(snapshot, ctx))
        .collect::<Result<Vec<_>>>()?;

    Ok(SamplerState {
        master_seed: record.master_seed,
        round: record.round,
        elapsed: Duration::from_secs_f64(record.elapsed),
        converged: record.converged,
        chains,
        monitor: ConvergenceMonitor::from_history(
            ctx.settings().convergence,
            record.convergence_history,
        ),
    })
}

impl CheckpointRecord {
    /// Write the record, replacing any previous file atomically.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let json = serde_json::to_vec(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| McmcError::Io(err.error))?;
        Ok(())
    }

    /// Read a record, checking the format version before anything else.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let corrupted = |err: serde_json::Error| {
            McmcError::CheckpointFormat(format!("{path:?} is corrupted: {err}"))
        };
        let value: serde_json::Value = serde_json::from_str(&contents).map_err(corrupted)?;
        match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(version) if version == FORMAT_VERSION as u64 => {}
            Some(version) => {
                return Err(McmcError::CheckpointFormat(format!(
                    "format version {version} is not supported (expected {FORMAT_VERSION})"
                )))
            }
            None => {
                return Err(McmcError::CheckpointFormat(format!(
                    "{path:?} has no format version"
                )))
            }
        }
        serde_json::from_value(value).map_err(corrupted)
    }
}
