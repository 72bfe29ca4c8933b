use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{McmcError, Result};

/// Shape of the random step drawn by the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ProposalKind {
    Gaussian,
    /// Multivariate Student-t with `dof` degrees of freedom.
    StudentT { dof: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalSettings {
    pub kind: ProposalKind,
    /// Overall step scale. The step of a block with `k` parameters is
    /// scaled by `scale / sqrt(k)`.
    pub scale: f64,
}

impl Default for ProposalSettings {
    fn default() -> Self {
        Self {
            kind: ProposalKind::Gaussian,
            scale: 2.4,
        }
    }
}

/// How often the fast blocks are proposed relative to the slow ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OversamplingSettings {
    /// Explicit factor per block, slowest block first. Overrides `power`.
    pub factors: Option<Vec<u32>>,
    /// Factors are derived as `(cost_slowest / cost_block) ^ power`.
    /// Zero disables oversampling.
    pub power: f64,
}

impl Default for OversamplingSettings {
    fn default() -> Self {
        Self {
            factors: None,
            power: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    pub enabled: bool,
    /// Accepted samples per chain between two covariance updates.
    /// Defaults to 40 times the number of sampled parameters.
    pub learn_every: Option<u64>,
    /// Minimum effective sample size, as a multiple of the dimension,
    /// before an update is attempted.
    pub min_samples_factor: f64,
    /// Learn one covariance from all chains at synchronization points
    /// instead of one per chain.
    pub pooled: bool,
    /// Pooled updates are skipped while the convergence statistic is
    /// larger than this.
    pub max_rminus1: f64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            learn_every: None,
            min_samples_factor: 2.0,
            pooled: true,
            max_rminus1: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSettings {
    /// Stop once `R - 1` is below this for every sampled parameter.
    pub rminus1_stop: f64,
    /// Fraction of each chain (by weight) ignored by the statistics.
    pub burn_in: f64,
    /// Number of synchronization rounds before convergence may be declared.
    pub min_rounds: u64,
    /// Consecutive tests that must all pass before the chains count as
    /// converged.
    pub stable_rounds: usize,
    /// Number of pieces a lone chain is split into for the fallback check.
    pub single_split: usize,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            rminus1_stop: 0.01,
            burn_in: 0.3,
            min_rounds: 2,
            stable_rounds: 2,
            single_split: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory for chain files and the checkpoint
    pub dir: PathBuf,
    /// File name prefix, chain files are `{prefix}.{n}.txt`
    pub prefix: String,
    /// Digits after the decimal point in chain files
    pub precision: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("chains"),
            prefix: "mcmc".to_string(),
            precision: 10,
        }
    }
}

/// Settings for the adaptive Metropolis sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcSettings {
    /// Number of independent chains, one worker each.
    pub num_chains: usize,
    /// Size of the worker pool. Defaults to one thread per chain.
    pub num_threads: Option<usize>,
    /// Master seed. Chain `i` uses stream `i` of this seed.
    /// A random seed is chosen (and recorded) when missing.
    pub seed: Option<u64>,
    /// Metropolis steps each chain takes between synchronization points.
    pub steps_per_round: u64,
    /// Stop once every chain has accepted this many samples.
    pub max_samples: Option<u64>,
    /// Stop once every chain has taken this many steps.
    pub max_steps: Option<u64>,
    /// Wall-clock limit, checked at synchronization points.
    pub max_seconds: Option<f64>,
    /// Attempts at drawing a starting point with finite posterior.
    pub max_init_attempts: u64,
    /// Fail a chain after this many consecutive rejections.
    pub max_consecutive_rejections: Option<u64>,
    pub proposal: ProposalSettings,
    pub oversampling: OversamplingSettings,
    pub learning: LearningSettings,
    pub convergence: ConvergenceSettings,
    /// Write a checkpoint every this many rounds.
    pub checkpoint_every: u64,
    /// Where to write chains and checkpoints. Nothing is written when missing.
    pub output: Option<OutputSettings>,
    /// Discard existing output instead of resuming from it.
    pub force: bool,
    /// Proposal covariance to start from, in sampled-parameter order.
    pub initial_covariance: Option<Vec<Vec<f64>>>,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_threads: None,
            seed: None,
            steps_per_round: 200,
            max_samples: None,
            max_steps: None,
            max_seconds: None,
            max_init_attempts: 200,
            max_consecutive_rejections: None,
            proposal: ProposalSettings::default(),
            oversampling: OversamplingSettings::default(),
            learning: LearningSettings::default(),
            convergence: ConvergenceSettings::default(),
            checkpoint_every: 1,
            output: None,
            force: false,
            initial_covariance: None,
        }
    }
}

fn config_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(McmcError::Configuration(msg.into()))
}

impl McmcSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|err| McmcError::Configuration(format!("could not parse settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return config_error("num_chains must be at least 1");
        }
        if self.num_threads == Some(0) {
            return config_error("num_threads must be at least 1");
        }
        if self.steps_per_round == 0 {
            return config_error("steps_per_round must be at least 1");
        }
        if self.max_init_attempts == 0 {
            return config_error("max_init_attempts must be at least 1");
        }
        if self.checkpoint_every == 0 {
            return config_error("checkpoint_every must be at least 1");
        }
        if let Some(seconds) = self.max_seconds {
            if !(seconds > 0.0) {
                return config_error("max_seconds must be positive");
            }
        }
        if !(self.proposal.scale > 0.0 && self.proposal.scale.is_finite()) {
            return config_error("proposal scale must be positive and finite");
        }
        if let ProposalKind::StudentT { dof } = self.proposal.kind {
            if !(dof > 0.0 && dof.is_finite()) {
                return config_error("Student-t proposal needs positive degrees of freedom");
            }
        }
        if !(self.oversampling.power >= 0.0 && self.oversampling.power.is_finite()) {
            return config_error("oversampling power must be non-negative");
        }
        if let Some(factors) = &self.oversampling.factors {
            if factors.iter().any(|&f| f == 0) {
                return config_error("oversampling factors must be at least 1");
            }
        }
        if self.learning.learn_every == Some(0) {
            return config_error("learn_every must be at least 1");
        }
        if !(self.learning.min_samples_factor >= 0.0) {
            return config_error("min_samples_factor must be non-negative");
        }
        if !(self.learning.max_rminus1 > 0.0) {
            return config_error("learning max_rminus1 must be positive");
        }
        let conv = &self.convergence;
        if !(conv.rminus1_stop > 0.0) {
            return config_error("rminus1_stop must be positive");
        }
        if !(0.0..1.0).contains(&conv.burn_in) {
            return config_error("burn_in must lie in [0, 1)");
        }
        if conv.stable_rounds == 0 {
            return config_error("stable_rounds must be at least 1");
        }
        if conv.single_split < 2 {
            return config_error("single_split must be at least 2");
        }
        Ok(())
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads.unwrap_or(self.num_chains)
    }

    pub(crate) fn learn_every(&self, dim: usize) -> u64 {
        self.learning.learn_every.unwrap_or(40 * dim as u64).max(1)
    }

    pub(crate) fn min_learn_samples(&self, dim: usize) -> f64 {
        self.learning.min_samples_factor * dim as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        McmcSettings::default().validate().unwrap();
    }

    #[test]
    fn partial_json_uses_defaults() {
        let settings = McmcSettings::from_json_str(
            r#"{
                "num_chains": 2,
                "seed": 7,
                "proposal": {"kind": {"type": "student_t", "dof": 3.0}},
                "convergence": {"rminus1_stop": 0.05}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.num_chains, 2);
        assert_eq!(settings.seed, Some(7));
        assert_eq!(settings.proposal.kind, ProposalKind::StudentT { dof: 3.0 });
        assert_eq!(settings.proposal.scale, 2.4);
        assert_eq!(settings.convergence.rminus1_stop, 0.05);
        assert_eq!(settings.convergence.burn_in, 0.3);
        assert_eq!(settings.convergence.stable_rounds, 2);
        assert_eq!(settings.steps_per_round, 200);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = [
            McmcSettings {
                num_chains: 0,
                ..Default::default()
            },
            McmcSettings {
                convergence: ConvergenceSettings {
                    burn_in: 1.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            McmcSettings {
                convergence: ConvergenceSettings {
                    stable_rounds: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            McmcSettings {
                proposal: ProposalSettings {
                    kind: ProposalKind::StudentT { dof: 0.0 },
                    scale: 2.4,
                },
                ..Default::default()
            },
            McmcSettings {
                oversampling: OversamplingSettings {
                    factors: Some(vec![1, 0]),
                    power: 0.4,
                },
                ..Default::default()
            },
        ];
        for settings in bad {
            assert!(matches!(
                settings.validate(),
                Err(McmcError::Configuration(_))
            ));
        }
    }

    #[test]
    fn learn_every_scales_with_dimension() {
        let settings = McmcSettings::default();
        assert_eq!(settings.learn_every(3), 120);
        let settings = McmcSettings {
            learning: LearningSettings {
                learn_every: Some(10),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(settings.learn_every(3), 10);
    }
}
