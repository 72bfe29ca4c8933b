//! Adapter around the user supplied likelihoods.
//!
//! The posterior adds the prior density of the parameter space to the sum
//! of all likelihoods. It holds no mutable state, so the same `Posterior`
//! is evaluated concurrently by all chains.

use serde::{Deserialize, Serialize};

use crate::error::{LikelihoodError, McmcError, Result};
use crate::parameters::{DerivedValues, ParamSlot, ParamValues, ParameterSpace};

/// A log-likelihood of the sampled and fixed parameters.
///
/// Implementations must be safe to call from several chains at once.
pub trait Likelihood: Send + Sync {
    fn name(&self) -> &str;

    /// Relative cost of one evaluation.
    fn cost(&self) -> f64 {
        1.0
    }

    /// Sampled or fixed parameters the likelihood depends on, `None` for
    /// all of them.
    ///
    /// A sampled parameter without a declared cost costs as much as all
    /// likelihoods that depend on it together, which decides its block.
    fn requires(&self) -> Option<Vec<String>> {
        None
    }

    /// Evaluate the log-likelihood, optionally storing derived parameters.
    ///
    /// Returning [`LikelihoodError::Domain`] or a non-finite value rejects
    /// the point. [`LikelihoodError::Fatal`] stops sampling.
    fn log_likelihood(
        &self,
        params: &ParamValues<'_>,
        derived: &mut DerivedValues<'_>,
    ) -> std::result::Result<f64, LikelihoodError>;
}

/// Likelihood defined by a closure over the sampled values.
pub struct FnLikelihood<F> {
    name: String,
    cost: f64,
    requires: Option<Vec<String>>,
    func: F,
}

impl<F> FnLikelihood<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            cost: 1.0,
            requires: None,
            func,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Restrict the parameters the likelihood depends on.
    pub fn requiring<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.requires = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

impl<F> Likelihood for FnLikelihood<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn requires(&self) -> Option<Vec<String>> {
        self.requires.clone()
    }

    fn log_likelihood(
        &self,
        params: &ParamValues<'_>,
        _derived: &mut DerivedValues<'_>,
    ) -> std::result::Result<f64, LikelihoodError> {
        Ok((self.func)(params.sampled()))
    }
}

/// An evaluated point in parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Sampled parameter values
    pub values: Vec<f64>,
    /// Derived parameters, `None` if no likelihood provided them
    pub derived: Vec<Option<f64>>,
    pub log_prior: f64,
    /// One entry per likelihood, in the order of the posterior. NaN for
    /// likelihoods that were not evaluated.
    pub log_likelihoods: Vec<f64>,
    pub log_posterior: f64,
}

impl Point {
    pub fn is_finite(&self) -> bool {
        self.log_posterior.is_finite()
    }
}

pub struct Posterior {
    space: ParameterSpace,
    likelihoods: Vec<Box<dyn Likelihood>>,
}

impl std::fmt::Debug for Posterior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Posterior")
            .field("space", &self.space)
            .field("likelihoods", &self.likelihood_names().collect::<Vec<_>>())
            .finish()
    }
}

impl Posterior {
    /// Combine a parameter space with likelihoods. Sampled parameters
    /// without a declared cost get theirs from the likelihoods.
    pub fn new(mut space: ParameterSpace, likelihoods: Vec<Box<dyn Likelihood>>) -> Result<Self> {
        let mut requirements = Vec::with_capacity(likelihoods.len());
        for (i, like) in likelihoods.iter().enumerate() {
            let name = like.name();
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(McmcError::Configuration(format!(
                    "invalid likelihood name `{name}`"
                )));
            }
            if likelihoods[..i].iter().any(|other| other.name() == name) {
                return Err(McmcError::Configuration(format!(
                    "likelihood `{name}` is defined twice"
                )));
            }
            if space.slot(name).is_some() {
                return Err(McmcError::Configuration(format!(
                    "likelihood `{name}` has the same name as a parameter"
                )));
            }
            if !(like.cost() > 0.0 && like.cost().is_finite()) {
                return Err(McmcError::Configuration(format!(
                    "likelihood `{name}` reports an invalid cost"
                )));
            }
            let requires = like.requires();
            for param in requires.iter().flatten() {
                match space.slot(param) {
                    Some(ParamSlot::Sampled(_) | ParamSlot::Fixed(_)) => {}
                    _ => {
                        return Err(McmcError::Configuration(format!(
                            "likelihood `{name}` requires unknown parameter `{param}`"
                        )))
                    }
                }
            }
            requirements.push(requires);
        }

        // Parameters no likelihood depends on count as the cheapest one.
        let cheapest = likelihoods
            .iter()
            .map(|like| like.cost())
            .fold(f64::INFINITY, f64::min);
        space.derive_costs(|param| {
            let cost: f64 = likelihoods
                .iter()
                .zip(&requirements)
                .filter(|(_, requires)| match requires {
                    Some(names) => names.iter().any(|name| name == param),
                    None => true,
                })
                .map(|(like, _)| like.cost())
                .sum();
            if cost > 0. {
                cost
            } else if cheapest.is_finite() {
                cheapest
            } else {
                1.0
            }
        });

        Ok(Self {
            space,
            likelihoods,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn likelihood_names(&self) -> impl Iterator<Item = &str> {
        self.likelihoods.iter().map(|like| like.name())
    }

    /// Evaluate prior and likelihoods at `values`.
    ///
    /// Points outside the prior support or rejected by a likelihood come
    /// back as non-finite points. Likelihoods after the first rejecting
    /// one are not called.
    pub fn evaluate(&self, values: &[f64]) -> Result<Point> {
        let space = &self.space;
        let mut point = Point {
            values: values.to_vec(),
            derived: vec![None; space.derived_names().len()],
            log_prior: space.log_prior(values),
            log_likelihoods: vec![f64::NAN; self.likelihoods.len()],
            log_posterior: f64::NEG_INFINITY,
        };
        if !point.log_prior.is_finite() {
            return Ok(point);
        }

        let params = ParamValues::new(space, values);
        let mut log_posterior = point.log_prior;
        for (i, like) in self.likelihoods.iter().enumerate() {
            let result = {
                let mut derived = DerivedValues::new(space, &mut point.derived);
                like.log_likelihood(&params, &mut derived)
            };
            match result {
                Ok(logp) if logp.is_finite() => {
                    point.log_likelihoods[i] = logp;
                    log_posterior += logp;
                }
                Ok(logp) => {
                    log::debug!("Likelihood `{}` returned {logp}", like.name());
                    point.log_likelihoods[i] = logp;
                    return Ok(point);
                }
                Err(err) if err.is_recoverable() => {
                    log::debug!("Likelihood `{}` rejected point: {err}", like.name());
                    return Ok(point);
                }
                Err(err) => {
                    return Err(McmcError::Likelihood {
                        name: like.name().to_string(),
                        source: err,
                    });
                }
            }
        }
        point.log_posterior = log_posterior;
        Ok(point)
    }
}
