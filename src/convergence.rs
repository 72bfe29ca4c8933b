//! Multi-chain convergence test.
//!
//! For every sampled parameter the variance of the chain means is compared
//! to the mean within-chain variance, both computed on the weighted samples
//! left after discarding the burn-in:
//!
//! ```text
//! W = 1/M sum_j s_j^2
//! B = 1/(M-1) sum_j (m_j - m)^2
//! R - 1 = B / W
//! ```
//!
//! where `m_j` and `s_j^2` are the weighted mean and (count-weighted,
//! unbiased) variance of chain `j`. A single chain is split into pieces of
//! about equal weight, made of whole rounds, that take the place of the
//! chains.

use serde::{Deserialize, Serialize};

use crate::chain::McmcChain;
use crate::covariance::WeightedMoments;
use crate::settings::ConvergenceSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Statistic computed from independent chains
    Full,
    /// Statistic computed from pieces of a single chain
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterConvergence {
    pub between: f64,
    pub within: f64,
    pub rminus1: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceStats {
    pub round: u64,
    pub parameters: Vec<ParameterConvergence>,
    pub max_rminus1: f64,
    pub confidence: Confidence,
}

/// Compact per-round summary kept in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub round: u64,
    pub max_rminus1: f64,
    pub confidence: Confidence,
}

/// `R - 1` per parameter, or `None` if a group has too little weight or
/// no spread.
pub fn variance_ratio(groups: &[WeightedMoments]) -> Option<Vec<ParameterConvergence>> {
    if groups.len() < 2 || groups.iter().any(|g| g.total_weight() <= 1.) {
        return None;
    }
    let num_groups = groups.len() as f64;
    let dim = groups[0].mean().len();

    (0..dim)
        .map(|p| {
            let within = groups
                .iter()
                .map(|g| g.variance(p))
                .sum::<Option<f64>>()?
                / num_groups;
            if !(within > 0. && within.is_finite()) {
                return None;
            }
            let grand_mean = groups.iter().map(|g| g.mean()[p]).sum::<f64>() / num_groups;
            let between = groups
                .iter()
                .map(|g| (g.mean()[p] - grand_mean).powi(2))
                .sum::<f64>()
                / (num_groups - 1.);
            Some(ParameterConvergence {
                between,
                within,
                rminus1: between / within,
            })
        })
        .collect()
}

/// Join consecutive pieces of a chain into `groups` groups of roughly
/// equal weight. Each piece goes to the group holding its midpoint.
///
/// `None` if some group would stay empty.
pub fn split_by_weight(pieces: &[WeightedMoments], groups: usize) -> Option<Vec<WeightedMoments>> {
    let dim = pieces.first()?.dim();
    let total: f64 = pieces.iter().map(WeightedMoments::total_weight).sum();
    if groups == 0 || pieces.len() < groups || !(total > 0.) {
        return None;
    }
    let mut out: Vec<_> = (0..groups).map(|_| WeightedMoments::new(dim)).collect();
    let mut before = 0.;
    for piece in pieces {
        let mid = before + 0.5 * piece.total_weight();
        let group = ((mid / total * groups as f64) as usize).min(groups - 1);
        out[group].merge(piece);
        before += piece.total_weight();
    }
    out.iter().all(|g| g.total_weight() > 0.).then_some(out)
}

#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    settings: ConvergenceSettings,
    history: Vec<ConvergenceRecord>,
    warned_single_chain: bool,
}

impl ConvergenceMonitor {
    pub fn new(settings: ConvergenceSettings) -> Self {
        Self::from_history(settings, Vec::new())
    }

    pub fn from_history(settings: ConvergenceSettings, history: Vec<ConvergenceRecord>) -> Self {
        Self {
            settings,
            history,
            warned_single_chain: false,
        }
    }

    pub fn history(&self) -> &[ConvergenceRecord] {
        &self.history
    }

    /// The most recent value of the statistic.
    pub fn last_rminus1(&self) -> Option<f64> {
        self.history.last().map(|record| record.max_rminus1)
    }

    /// Compute the statistic for the chains at a synchronization point.
    pub fn check(&mut self, round: u64, chains: &[McmcChain]) -> Option<ConvergenceStats> {
        let burn_in = self.settings.burn_in;
        let (groups, confidence) = match chains {
            [] => return None,
            [single] => {
                if !self.warned_single_chain {
                    log::warn!(
                        "Only one chain: convergence is judged from {} pieces of it and is less reliable",
                        self.settings.single_split
                    );
                    self.warned_single_chain = true;
                }
                let pieces = single.post_burn_in(burn_in);
                let groups = split_by_weight(&pieces, self.settings.single_split)?;
                (groups, Confidence::Reduced)
            }
            chains => {
                let groups = chains.iter().map(|chain| chain.moments(burn_in)).collect();
                (groups, Confidence::Full)
            }
        };
        self.check_groups(round, &groups, confidence)
    }

    pub fn check_groups(
        &mut self,
        round: u64,
        groups: &[WeightedMoments],
        confidence: Confidence,
    ) -> Option<ConvergenceStats> {
        let parameters = variance_ratio(groups)?;
        let max_rminus1 = parameters
            .iter()
            .map(|p| p.rminus1)
            .fold(f64::NEG_INFINITY, f64::max);
        self.history.push(ConvergenceRecord {
            round,
            max_rminus1,
            confidence,
        });
        Some(ConvergenceStats {
            round,
            parameters,
            max_rminus1,
            confidence,
        })
    }

    /// Enough rounds passed and the statistic stayed below the threshold
    /// for the last `stable_rounds` tests, the one in `stats` included.
    pub fn is_converged(&self, stats: &ConvergenceStats) -> bool {
        let stable = self.settings.stable_rounds;
        if stats.round < self.settings.min_rounds || self.history.len() < stable {
            return false;
        }
        let recent = &self.history[self.history.len() - stable..];
        recent.last().map(|record| record.round) == Some(stats.round)
            && recent
                .iter()
                .all(|record| record.max_rminus1 < self.settings.rminus1_stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn group(values: &[(f64, u64)]) -> WeightedMoments {
        let mut moments = WeightedMoments::new(1);
        for &(x, w) in values {
            moments.add(&[x], w as f64);
        }
        moments
    }

    #[test]
    fn ratio_of_shifted_groups() {
        // both groups have variance 1, means 0 and 1
        let a = group(&[(-1., 1), (0., 1), (1., 1)]);
        let b = group(&[(0., 1), (1., 1), (2., 1)]);
        let stats = variance_ratio(&[a, b]).unwrap();
        assert_abs_diff_eq!(stats[0].within, 1., epsilon = 1e-12);
        assert_abs_diff_eq!(stats[0].between, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats[0].rminus1, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn identical_groups_have_zero_ratio() {
        let a = group(&[(1., 2), (3., 1), (-2., 4)]);
        let b = group(&[(1., 2), (3., 1), (-2., 4)]);
        let stats = variance_ratio(&[a, b]).unwrap();
        assert_abs_diff_eq!(stats[0].rminus1, 0., epsilon = 1e-15);
    }

    #[test]
    fn degenerate_groups_give_nothing() {
        assert!(variance_ratio(&[group(&[(1., 5)])]).is_none());
        assert!(variance_ratio(&[group(&[(1., 5)]), group(&[(1., 1)])]).is_none());
        // no spread at all
        assert!(variance_ratio(&[group(&[(1., 5)]), group(&[(2., 5)])]).is_none());
    }

    #[test]
    fn split_keeps_total_weight() {
        let weights = [3u64, 1, 4, 1, 5, 9, 2];
        let pieces: Vec<_> = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| group(&[(i as f64, w)]))
            .collect();
        let groups = split_by_weight(&pieces, 4).unwrap();
        let sizes: Vec<f64> = groups.iter().map(|g| g.total_weight()).collect();
        // 25 total, pieces go where their midpoint falls
        assert_eq!(sizes, vec![8., 6., 9., 2.]);
        assert_eq!(sizes.iter().sum::<f64>(), 25.);

        assert!(split_by_weight(&pieces[..3], 4).is_none());
        // one piece holds almost everything, a group stays empty
        let lopsided = [group(&[(0., 100)]), group(&[(1., 1)]), group(&[(2., 1)])];
        assert!(split_by_weight(&lopsided, 3).is_none());
    }

    fn settings(min_rounds: u64, stable_rounds: usize) -> ConvergenceSettings {
        ConvergenceSettings {
            rminus1_stop: 0.1,
            min_rounds,
            stable_rounds,
            ..Default::default()
        }
    }

    #[test]
    fn monitor_waits_for_min_rounds() {
        let mut monitor = ConvergenceMonitor::new(settings(3, 1));
        let groups = [group(&[(0., 1), (1., 1)]), group(&[(0., 1), (1., 1)])];

        let early = monitor.check_groups(2, &groups, Confidence::Full).unwrap();
        assert!(!monitor.is_converged(&early));
        let late = monitor.check_groups(3, &groups, Confidence::Full).unwrap();
        assert!(monitor.is_converged(&late));
        assert_eq!(monitor.history().len(), 2);
        assert_eq!(monitor.last_rminus1(), Some(0.));
    }

    #[test]
    fn one_lucky_round_is_not_enough() {
        let mut monitor = ConvergenceMonitor::new(settings(1, 2));
        let close = [group(&[(0., 1), (1., 1)]), group(&[(0., 1), (1., 1)])];
        let apart = [group(&[(0., 1), (1., 1)]), group(&[(5., 1), (6., 1)])];

        let high = monitor.check_groups(1, &apart, Confidence::Full).unwrap();
        assert!(!monitor.is_converged(&high));
        let low = monitor.check_groups(2, &close, Confidence::Full).unwrap();
        assert!(!monitor.is_converged(&low));
        let high = monitor.check_groups(3, &apart, Confidence::Full).unwrap();
        assert!(!monitor.is_converged(&high));

        let low = monitor.check_groups(4, &close, Confidence::Full).unwrap();
        assert!(!monitor.is_converged(&low));
        let low = monitor.check_groups(5, &close, Confidence::Full).unwrap();
        assert!(monitor.is_converged(&low));
    }

    #[test]
    fn stability_survives_a_restart_from_history() {
        let mut monitor = ConvergenceMonitor::new(settings(1, 2));
        let close = [group(&[(0., 1), (1., 1)]), group(&[(0., 1), (1., 1)])];
        monitor.check_groups(1, &close, Confidence::Full).unwrap();

        let mut restored =
            ConvergenceMonitor::from_history(settings(1, 2), monitor.history().to_vec());
        let stats = restored.check_groups(2, &close, Confidence::Full).unwrap();
        assert!(restored.is_converged(&stats));
    }
}
