//! Adaptive Metropolis sampling for posteriors with a speed hierarchy.
//!
//! Parameters are grouped into blocks by how expensive it is to change
//! them. Cheap blocks are proposed more often than expensive ones, the
//! proposal covariance is learned from the chains while they run, and a
//! variance-ratio test across several parallel chains decides when to
//! stop. Runs can be checkpointed and resumed with identical results.
//!
//! ```no_run
//! use speedy_mh::{FnLikelihood, McmcSettings, ParameterDef, ParameterSpace, Posterior, Prior, Sampler};
//!
//! let space = ParameterSpace::new([
//!     ParameterDef::sampled("a", Prior::Uniform { min: -5., max: 5. }),
//!     ParameterDef::sampled("b", Prior::Uniform { min: -5., max: 5. }).with_cost(20.),
//! ])?;
//! let like = FnLikelihood::new("gauss", |v: &[f64]| -0.5 * (v[0] * v[0] + v[1] * v[1]));
//! let posterior = Posterior::new(space, vec![Box::new(like)])?;
//!
//! let settings = McmcSettings {
//!     seed: Some(42),
//!     max_steps: Some(10_000),
//!     ..Default::default()
//! };
//! let summary = Sampler::new(posterior, settings)?.run()?;
//! println!("{:?}", summary.termination);
//! # Ok::<(), speedy_mh::McmcError>(())
//! ```

pub(crate) mod chain;
pub(crate) mod checkpoint;
pub(crate) mod convergence;
pub(crate) mod covariance;
pub(crate) mod error;
pub(crate) mod output;
pub(crate) mod parameters;
pub(crate) mod posterior;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub(crate) mod settings;

pub use chain::{
    acceptance_probability, ChainEntry, ChainPhase, ChainSnapshot, ChainStats, McmcChain,
    RngState, StepOutcome,
};
pub use checkpoint::{restore, save, CheckpointRecord, SamplerState, FORMAT_VERSION};
pub use convergence::{
    split_by_weight, variance_ratio, Confidence, ConvergenceMonitor, ConvergenceRecord,
    ConvergenceStats, ParameterConvergence,
};
pub use covariance::{CovarianceMatrix, ProposalCovariance, WeightedMoments};
pub use error::{LikelihoodError, McmcError, Result};
pub use output::{chain_path, checkpoint_path, read_chain, ChainWriter};
pub use parameters::{
    DerivedValues, ParamSlot, ParamValues, ParameterBlock, ParameterDef, ParameterKind,
    ParameterSpace, Prior, SampledParameter,
};
pub use posterior::{FnLikelihood, Likelihood, Point, Posterior};
pub use proposal::{oversampling_factors, ProposalSchedule, Proposer};
pub use sampler::{RunContext, RunSummary, Sampler, StopHandle, Termination};
pub use settings::{
    ConvergenceSettings, LearningSettings, McmcSettings, OutputSettings, OversamplingSettings,
    ProposalKind, ProposalSettings,
};
