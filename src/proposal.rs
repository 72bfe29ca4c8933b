use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use crate::covariance::ProposalCovariance;
use crate::error::{McmcError, Result};
use crate::parameters::ParameterBlock;
use crate::settings::{OversamplingSettings, ProposalKind, ProposalSettings};

/// Which block is proposed at each step of a cycle.
///
/// Block `i` appears `factor_i * dim_i` times per cycle, slow blocks first,
/// so the cheap parameters are moved many times for every move of the
/// expensive ones. The schedule only depends on the blocks and the
/// settings, so a chain's step counter fully determines the block.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalSchedule {
    factors: Vec<u32>,
    cycle: Vec<usize>,
}

impl ProposalSchedule {
    pub fn new(blocks: &[ParameterBlock], settings: &OversamplingSettings) -> Result<Self> {
        let factors = match &settings.factors {
            Some(factors) => {
                if factors.len() != blocks.len() {
                    return Err(McmcError::Configuration(format!(
                        "got {} oversampling factors for {} parameter blocks",
                        factors.len(),
                        blocks.len()
                    )));
                }
                if factors.iter().any(|&f| f == 0) {
                    return Err(McmcError::Configuration(
                        "oversampling factors must be at least 1".to_string(),
                    ));
                }
                factors.clone()
            }
            None => oversampling_factors(blocks, settings.power),
        };

        let cycle = blocks
            .iter()
            .zip(&factors)
            .enumerate()
            .flat_map(|(idx, (block, &factor))| {
                std::iter::repeat(idx).take(factor as usize * block.dim())
            })
            .collect();

        Ok(Self { factors, cycle })
    }

    pub fn factors(&self) -> &[u32] {
        &self.factors
    }

    pub fn cycle(&self) -> &[usize] {
        &self.cycle
    }

    pub fn block_for_step(&self, step: u64) -> usize {
        self.cycle[(step % self.cycle.len() as u64) as usize]
    }
}

/// `max(1, round((cost_slowest / cost_i) ^ power))` for every block.
pub fn oversampling_factors(blocks: &[ParameterBlock], power: f64) -> Vec<u32> {
    let Some(slowest) = blocks.first().map(|b| b.cost()) else {
        return Vec::new();
    };
    blocks
        .iter()
        .map(|block| {
            let factor = (slowest / block.cost()).powf(power).round();
            factor.clamp(1., u32::MAX as f64) as u32
        })
        .collect()
}

/// Draws candidate points around the current point.
#[derive(Debug, Clone)]
pub struct Proposer {
    settings: ProposalSettings,
    chi_squared: Option<ChiSquared<f64>>,
}

impl Proposer {
    pub fn new(settings: ProposalSettings) -> Result<Self> {
        let chi_squared = match settings.kind {
            ProposalKind::Gaussian => None,
            ProposalKind::StudentT { dof } => Some(ChiSquared::new(dof).map_err(|err| {
                McmcError::Configuration(format!("invalid Student-t proposal: {err}"))
            })?),
        };
        Ok(Self {
            settings,
            chi_squared,
        })
    }

    /// Candidate that moves only the parameters of `block`.
    ///
    /// The step is `scale / sqrt(k) * A z` where `A` is the square root of
    /// the block's covariance and `z` is standard normal (scaled by a
    /// chi-squared draw for Student-t steps). The result only depends on
    /// the rng state, the covariance and `current`.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        covariance: &ProposalCovariance,
        blocks: &[ParameterBlock],
        block: usize,
        current: &[f64],
    ) -> Vec<f64> {
        let indices = blocks[block].indices();
        let dim = indices.len();

        let mut z: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
        if let (Some(chi_squared), ProposalKind::StudentT { dof }) =
            (&self.chi_squared, self.settings.kind)
        {
            let u: f64 = chi_squared.sample(rng);
            let stretch = (dof / u).sqrt();
            z.iter_mut().for_each(|z| *z *= stretch);
        }

        let mut step = vec![0f64; dim];
        covariance.factor(block).apply(&z, &mut step);

        let scale = self.settings.scale / (dim as f64).sqrt();
        let mut candidate = current.to_vec();
        for (&idx, delta) in indices.iter().zip(step) {
            candidate[idx] = scale.mul_add(delta, candidate[idx]);
        }
        candidate
    }
}
