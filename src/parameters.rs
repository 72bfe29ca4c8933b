//! Description of the parameter space: sampled, derived and fixed
//! parameters, their priors, and the partition of the sampled parameters
//! into blocks of equal evaluation cost.

use std::collections::HashMap;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::covariance::CovarianceMatrix;
use crate::error::{McmcError, Result};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Prior distribution of a sampled parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "dist")]
pub enum Prior {
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
    /// Uniform in `ln(x)` on `[min, max]`, with `min > 0`.
    LogUniform { min: f64, max: f64 },
}

impl Prior {
    fn validate(&self, name: &str) -> Result<()> {
        let ok = match *self {
            Prior::Uniform { min, max } => min.is_finite() && max.is_finite() && max > min,
            Prior::Normal { mean, std } => mean.is_finite() && std.is_finite() && std > 0.0,
            Prior::LogUniform { min, max } => {
                min.is_finite() && max.is_finite() && min > 0.0 && max > min
            }
        };
        if ok {
            Ok(())
        } else {
            Err(McmcError::Configuration(format!(
                "prior {self:?} of parameter `{name}` has no positive support width"
            )))
        }
    }

    /// Hard bounds of the support.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Prior::Uniform { min, max } | Prior::LogUniform { min, max } => (min, max),
            Prior::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn contains(&self, x: f64) -> bool {
        let (lower, upper) = self.bounds();
        (lower..=upper).contains(&x)
    }

    /// Normalized log density, `-inf` outside the support.
    pub fn log_density(&self, x: f64) -> f64 {
        if !self.contains(x) {
            return f64::NEG_INFINITY;
        }
        match *self {
            Prior::Uniform { min, max } => -(max - min).ln(),
            Prior::Normal { mean, std } => {
                let z = (x - mean) / std;
                -0.5 * z * z - std.ln() - LN_SQRT_2PI
            }
            Prior::LogUniform { min, max } => -x.ln() - (max / min).ln().ln(),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Uniform { min, max } => rng.random_range(min..max),
            Prior::Normal { mean, std } => {
                let z: f64 = rng.sample(StandardNormal);
                std.mul_add(z, mean)
            }
            Prior::LogUniform { min, max } => rng.random_range(min.ln()..max.ln()).exp(),
        }
    }

    /// Standard deviation, used as the default proposal width.
    pub fn std(&self) -> f64 {
        match *self {
            Prior::Uniform { min, max } => (max - min) / 12f64.sqrt(),
            Prior::Normal { std, .. } => std,
            Prior::LogUniform { min, max } => {
                let log_ratio = (max / min).ln();
                let mean = (max - min) / log_ratio;
                let second = (max * max - min * min) / (2.0 * log_ratio);
                (second - mean * mean).max(0.0).sqrt()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ParameterKind {
    Sampled {
        prior: Prior,
        /// Distribution for starting points. The prior is used when missing.
        #[serde(default)]
        reference: Option<Prior>,
        /// Initial proposal width. Defaults to the standard deviation of
        /// the prior.
        #[serde(default)]
        proposal: Option<f64>,
        /// Relative cost of re-evaluating the posterior after changing
        /// this parameter. Higher is slower. When missing, the cost comes
        /// from the likelihoods that depend on the parameter.
        #[serde(default)]
        cost: Option<f64>,
    },
    /// Computed by a likelihood, recorded in the chain output.
    Derived,
    Fixed {
        value: f64,
    },
}

/// Declarative definition of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

impl ParameterDef {
    pub fn sampled(name: impl Into<String>, prior: Prior) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Sampled {
                prior,
                reference: None,
                proposal: None,
                cost: None,
            },
        }
    }

    pub fn derived(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Derived,
        }
    }

    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Fixed { value },
        }
    }

    pub fn with_proposal(mut self, width: f64) -> Self {
        if let ParameterKind::Sampled { proposal, .. } = &mut self.kind {
            *proposal = Some(width);
        }
        self
    }

    pub fn with_cost(mut self, value: f64) -> Self {
        if let ParameterKind::Sampled { cost, .. } = &mut self.kind {
            *cost = Some(value);
        }
        self
    }

    pub fn with_reference(mut self, dist: Prior) -> Self {
        if let ParameterKind::Sampled { reference, .. } = &mut self.kind {
            *reference = Some(dist);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledParameter {
    pub name: String,
    pub prior: Prior,
    pub reference: Option<Prior>,
    pub proposal: f64,
    /// Cost used for blocking.
    pub cost: f64,
    /// Cost given in the definition, if any.
    pub declared_cost: Option<f64>,
}

/// Sampled parameters sharing one evaluation cost.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    indices: Vec<usize>,
    cost: f64,
}

impl ParameterBlock {
    /// Positions of the block's parameters in the sampled vector.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn dim(&self) -> usize {
        self.indices.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSlot {
    Sampled(usize),
    Derived(usize),
    Fixed(usize),
}

/// Validated, immutable parameter space.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    sampled: Vec<SampledParameter>,
    derived: Vec<String>,
    fixed: Vec<(String, f64)>,
    blocks: Vec<ParameterBlock>,
    slots: HashMap<String, ParamSlot>,
}

impl ParameterSpace {
    pub fn new(defs: impl IntoIterator<Item = ParameterDef>) -> Result<Self> {
        let mut sampled = Vec::new();
        let mut derived = Vec::new();
        let mut fixed = Vec::new();
        let mut slots = HashMap::new();

        for def in defs {
            let ParameterDef { name, kind } = def;
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(McmcError::Configuration(format!(
                    "invalid parameter name `{name}`"
                )));
            }
            let slot = match kind {
                ParameterKind::Sampled {
                    prior,
                    reference,
                    proposal,
                    cost,
                } => {
                    prior.validate(&name)?;
                    if let Some(reference) = reference {
                        reference.validate(&name)?;
                        let (lower, upper) = prior.bounds();
                        let (ref_lower, ref_upper) = reference.bounds();
                        if ref_upper <= lower || ref_lower >= upper {
                            return Err(McmcError::Configuration(format!(
                                "reference distribution of `{name}` lies outside its prior bounds"
                            )));
                        }
                    }
                    let proposal = proposal.unwrap_or_else(|| prior.std());
                    if !(proposal > 0.0 && proposal.is_finite()) {
                        return Err(McmcError::Configuration(format!(
                            "proposal width of `{name}` must be positive, got {proposal}"
                        )));
                    }
                    if let Some(cost) = cost {
                        if !(cost > 0.0 && cost.is_finite()) {
                            return Err(McmcError::Configuration(format!(
                                "cost of `{name}` must be positive, got {cost}"
                            )));
                        }
                    }
                    sampled.push(SampledParameter {
                        name: name.clone(),
                        prior,
                        reference,
                        proposal,
                        cost: cost.unwrap_or(1.0),
                        declared_cost: cost,
                    });
                    ParamSlot::Sampled(sampled.len() - 1)
                }
                ParameterKind::Derived => {
                    derived.push(name.clone());
                    ParamSlot::Derived(derived.len() - 1)
                }
                ParameterKind::Fixed { value } => {
                    if !value.is_finite() {
                        return Err(McmcError::Configuration(format!(
                            "fixed parameter `{name}` must have a finite value"
                        )));
                    }
                    fixed.push((name.clone(), value));
                    ParamSlot::Fixed(fixed.len() - 1)
                }
            };
            if slots.insert(name.clone(), slot).is_some() {
                return Err(McmcError::Configuration(format!(
                    "parameter `{name}` is defined twice"
                )));
            }
        }

        if sampled.is_empty() {
            return Err(McmcError::Configuration(
                "at least one parameter must be sampled".to_string(),
            ));
        }

        let blocks = build_blocks(&sampled);

        Ok(Self {
            sampled,
            derived,
            fixed,
            blocks,
            slots,
        })
    }

    /// Number of sampled parameters
    pub fn dim(&self) -> usize {
        self.sampled.len()
    }

    pub fn sampled(&self) -> &[SampledParameter] {
        &self.sampled
    }

    pub fn sampled_names(&self) -> impl Iterator<Item = &str> {
        self.sampled.iter().map(|p| p.name.as_str())
    }

    pub fn derived_names(&self) -> &[String] {
        &self.derived
    }

    pub fn fixed(&self) -> &[(String, f64)] {
        &self.fixed
    }

    /// Blocks ordered from the slowest to the fastest.
    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    pub fn slot(&self, name: &str) -> Option<ParamSlot> {
        self.slots.get(name).copied()
    }

    pub fn in_bounds(&self, values: &[f64]) -> bool {
        self.sampled
            .iter()
            .zip(values)
            .all(|(param, &x)| param.prior.contains(x))
    }

    pub fn log_prior(&self, values: &[f64]) -> f64 {
        self.sampled
            .iter()
            .zip(values)
            .map(|(param, &x)| param.prior.log_density(x))
            .sum()
    }

    /// Draw a candidate starting point from the reference distributions.
    pub fn sample_reference<R: Rng + ?Sized>(&self, rng: &mut R, values: &mut [f64]) {
        for (param, value) in self.sampled.iter().zip(values.iter_mut()) {
            *value = param.reference.unwrap_or(param.prior).sample(rng);
        }
    }

    /// Set the cost of every parameter without a declared cost to
    /// `cost_of(name)` and rebuild the blocks.
    pub(crate) fn derive_costs(&mut self, cost_of: impl Fn(&str) -> f64) {
        for param in &mut self.sampled {
            if param.declared_cost.is_none() {
                param.cost = cost_of(&param.name);
            }
        }
        self.blocks = build_blocks(&self.sampled);
    }

    /// Diagonal covariance from the proposal widths.
    pub fn initial_covariance(&self) -> CovarianceMatrix {
        let variances: Vec<f64> = self.sampled.iter().map(|p| p.proposal.powi(2)).collect();
        CovarianceMatrix::diagonal(&variances)
    }
}

fn build_blocks(sampled: &[SampledParameter]) -> Vec<ParameterBlock> {
    let mut costs: Vec<f64> = sampled.iter().map(|p| p.cost).collect();
    costs.sort_by(|a, b| b.total_cmp(a));
    costs.dedup();
    costs
        .into_iter()
        .map(|cost| ParameterBlock {
            indices: sampled
                .iter()
                .enumerate()
                .filter(|(_, p)| p.cost == cost)
                .map(|(i, _)| i)
                .collect(),
            cost,
        })
        .collect()
}

/// Read access to the parameter values of a point, by name.
#[derive(Debug, Clone, Copy)]
pub struct ParamValues<'a> {
    space: &'a ParameterSpace,
    sampled: &'a [f64],
}

impl<'a> ParamValues<'a> {
    pub(crate) fn new(space: &'a ParameterSpace, sampled: &'a [f64]) -> Self {
        Self { space, sampled }
    }

    /// Value of a sampled or fixed parameter.
    pub fn get(&self, name: &str) -> Option<f64> {
        match self.space.slot(name)? {
            ParamSlot::Sampled(i) => Some(self.sampled[i]),
            ParamSlot::Fixed(i) => Some(self.space.fixed[i].1),
            ParamSlot::Derived(_) => None,
        }
    }

    pub fn sampled(&self) -> &'a [f64] {
        self.sampled
    }
}

/// Sink for derived parameters computed by likelihoods.
#[derive(Debug)]
pub struct DerivedValues<'a> {
    space: &'a ParameterSpace,
    values: &'a mut [Option<f64>],
}

impl<'a> DerivedValues<'a> {
    pub(crate) fn new(space: &'a ParameterSpace, values: &'a mut [Option<f64>]) -> Self {
        Self { space, values }
    }

    /// Store a derived value. Returns false if `name` is not a derived
    /// parameter.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match self.space.slot(name) {
            Some(ParamSlot::Derived(i)) => {
                self.values[i] = Some(value);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn uniform(min: f64, max: f64) -> Prior {
        Prior::Uniform { min, max }
    }

    #[test]
    fn duplicate_names_fail() {
        let err = ParameterSpace::new([
            ParameterDef::sampled("a", uniform(0., 1.)),
            ParameterDef::fixed("a", 3.),
        ])
        .unwrap_err();
        assert!(matches!(err, McmcError::Configuration(_)));
    }

    #[test]
    fn empty_support_fails() {
        let err = ParameterSpace::new([ParameterDef::sampled("a", uniform(1., 1.))]).unwrap_err();
        assert!(matches!(err, McmcError::Configuration(_)));

        let err = ParameterSpace::new([ParameterDef::sampled(
            "a",
            Prior::Normal {
                mean: 0.,
                std: 0.,
            },
        )])
        .unwrap_err();
        assert!(matches!(err, McmcError::Configuration(_)));
    }

    #[test]
    fn non_positive_proposal_fails() {
        let err = ParameterSpace::new([
            ParameterDef::sampled("a", uniform(0., 1.)).with_proposal(-0.1)
        ])
        .unwrap_err();
        assert!(matches!(err, McmcError::Configuration(_)));
    }

    #[test]
    fn blocks_are_ordered_slowest_first() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("fast1", uniform(0., 1.)),
            ParameterDef::sampled("slow", uniform(0., 1.)).with_cost(100.),
            ParameterDef::derived("sigma8"),
            ParameterDef::sampled("fast2", uniform(0., 1.)),
            ParameterDef::sampled("medium", uniform(0., 1.)).with_cost(10.),
        ])
        .unwrap();

        assert_eq!(space.dim(), 4);
        let blocks: Vec<_> = space.blocks().iter().map(|b| b.indices().to_vec()).collect();
        assert_eq!(blocks, vec![vec![1], vec![3], vec![0, 2]]);
        assert_eq!(space.blocks()[0].cost(), 100.);
        assert_eq!(space.derived_names(), &["sigma8".to_string()]);
    }

    #[test]
    fn prior_densities() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("u", uniform(-1., 3.)),
            ParameterDef::sampled(
                "n",
                Prior::Normal {
                    mean: 1.,
                    std: 2.,
                },
            ),
        ])
        .unwrap();
        let expected = -(4f64.ln()) + (-0.5 * 0.25 - 2f64.ln() - LN_SQRT_2PI);
        assert_abs_diff_eq!(space.log_prior(&[0., 2.]), expected, epsilon = 1e-12);
        assert_eq!(space.log_prior(&[3.5, 2.]), f64::NEG_INFINITY);
        assert!(space.in_bounds(&[3., 100.]));
        assert!(!space.in_bounds(&[-1.5, 0.]));
    }

    #[test]
    fn log_uniform_integrates_to_one() {
        let prior = Prior::LogUniform { min: 1., max: 100. };
        let n = 200_000;
        let step = 99. / n as f64;
        let integral: f64 = (0..n)
            .map(|i| prior.log_density(1. + (i as f64 + 0.5) * step).exp() * step)
            .sum();
        assert_abs_diff_eq!(integral, 1., epsilon = 1e-6);
    }

    #[test]
    fn default_proposal_is_prior_std() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("a", uniform(0., 12f64.sqrt())),
            ParameterDef::sampled("b", uniform(0., 1.)).with_proposal(0.5),
        ])
        .unwrap();
        let cov = space.initial_covariance();
        assert_abs_diff_eq!(cov.get(0, 0), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(cov.get(1, 1), 0.25, epsilon = 1e-12);
        assert_eq!(cov.get(0, 1), 0.);
    }

    #[test]
    fn values_by_name() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("a", uniform(0., 1.)),
            ParameterDef::fixed("c", 7.),
            ParameterDef::derived("d"),
        ])
        .unwrap();
        let sampled = [0.25];
        let values = ParamValues::new(&space, &sampled);
        assert_eq!(values.get("a"), Some(0.25));
        assert_eq!(values.get("c"), Some(7.));
        assert_eq!(values.get("d"), None);
        assert_eq!(values.get("missing"), None);

        let mut derived = vec![None];
        let mut sink = DerivedValues::new(&space, &mut derived);
        assert!(sink.set("d", 1.5));
        assert!(!sink.set("a", 1.5));
        assert_eq!(derived, vec![Some(1.5)]);
    }

    #[test]
    fn definitions_from_json() {
        let defs: Vec<ParameterDef> = serde_json::from_str(
            r#"[
                {"name": "omega", "kind": "sampled",
                 "prior": {"dist": "uniform", "min": 0.0, "max": 1.0},
                 "cost": 50.0},
                {"name": "tau", "kind": "fixed", "value": 0.05},
                {"name": "h0", "kind": "derived"}
            ]"#,
        )
        .unwrap();
        let space = ParameterSpace::new(defs).unwrap();
        assert_eq!(space.dim(), 1);
        assert_eq!(space.sampled()[0].cost, 50.);
        assert_eq!(space.fixed(), &[("tau".to_string(), 0.05)]);
    }

    #[test]
    fn reference_draws_stay_in_support() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("a", Prior::LogUniform { min: 1e-3, max: 1. }),
            ParameterDef::sampled("b", uniform(-2., 2.)).with_reference(uniform(0.5, 0.6)),
        ])
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut values = [0f64; 2];
        for _ in 0..100 {
            space.sample_reference(&mut rng, &mut values);
            assert!(space.in_bounds(&values));
            assert!((0.5..0.6).contains(&values[1]));
        }
    }

    proptest! {
        #[test]
        fn blocks_partition_sampled_parameters(costs in prop::collection::vec(1u8..4, 1..12)) {
            let defs = costs.iter().enumerate().map(|(i, &c)| {
                ParameterDef::sampled(format!("p{i}"), uniform(0., 1.)).with_cost(c as f64)
            });
            let space = ParameterSpace::new(defs).unwrap();
            let mut seen: Vec<usize> = space.blocks().iter().flat_map(|b| b.indices().to_vec()).collect();
            seen.sort();
            prop_assert_eq!(seen, (0..costs.len()).collect::<Vec<_>>());
            for pair in space.blocks().windows(2) {
                prop_assert!(pair[0].cost() > pair[1].cost());
            }
        }
    }
}
