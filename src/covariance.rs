use faer::Mat;
use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::error::{McmcError, Result};
use crate::parameters::ParameterBlock;

/// Symmetric covariance over the sampled parameters, row major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    dim: usize,
    values: Vec<f64>,
    /// Effective number of samples this estimate was computed from.
    /// Zero for covariances that were not learned.
    learned_from: f64,
}

impl CovarianceMatrix {
    pub fn diagonal(variances: &[f64]) -> Self {
        let dim = variances.len();
        let mut values = vec![0f64; dim * dim];
        for (i, &var) in variances.iter().enumerate() {
            values[i * dim + i] = var;
        }
        Self {
            dim,
            values,
            learned_from: 0.,
        }
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.len();
        if rows.iter().any(|row| row.len() != dim) {
            return Err(McmcError::Configuration(
                "covariance matrix must be square".to_string(),
            ));
        }
        let matrix = Self {
            dim,
            values: rows.iter().flatten().copied().collect(),
            learned_from: 0.,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(McmcError::Configuration(format!("covariance matrix {msg}")));
        if self.values.len() != self.dim * self.dim {
            return fail("has the wrong number of entries");
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return fail("has non-finite entries");
        }
        for i in 0..self.dim {
            if self.get(i, i) <= 0. {
                return fail("has a non-positive variance");
            }
            for j in 0..i {
                let (a, b) = (self.get(i, j), self.get(j, i));
                if (a - b).abs() > 1e-10 * (a.abs() + b.abs()).max(f64::MIN_POSITIVE) {
                    return fail("is not symmetric");
                }
            }
        }
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.dim + col]
    }

    pub fn learned_from(&self) -> f64 {
        self.learned_from
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    fn submatrix(&self, indices: &[usize]) -> Mat<f64> {
        Mat::from_fn(indices.len(), indices.len(), |i, j| {
            self.get(indices[i], indices[j])
        })
    }
}

/// Weighted mean and co-moment accumulator.
///
/// Samples are added one at a time (weights are repeat counts), and two
/// accumulators can be merged, which is how the pooled estimate across
/// chains is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedMoments {
    dim: usize,
    total_weight: f64,
    total_weight_sq: f64,
    mean: Vec<f64>,
    comoment: Vec<f64>,
}

impl WeightedMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            total_weight: 0.,
            total_weight_sq: 0.,
            mean: vec![0f64; dim],
            comoment: vec![0f64; dim * dim],
        }
    }

    pub fn add(&mut self, x: &[f64], weight: f64) {
        debug_assert_eq!(x.len(), self.dim);
        if weight <= 0. {
            return;
        }
        self.total_weight += weight;
        self.total_weight_sq += weight * weight;
        let frac = weight / self.total_weight;
        // x - new_mean = (1 - frac) (x - old_mean)
        let scale = weight * (1. - frac);
        for i in 0..self.dim {
            let di = x[i] - self.mean[i];
            for j in 0..self.dim {
                self.comoment[i * self.dim + j] += scale * di * (x[j] - self.mean[j]);
            }
        }
        izip!(self.mean.iter_mut(), x).for_each(|(mean, x)| *mean += frac * (x - *mean));
    }

    pub fn merge(&mut self, other: &WeightedMoments) {
        debug_assert_eq!(other.dim, self.dim);
        if other.total_weight == 0. {
            return;
        }
        let total = self.total_weight + other.total_weight;
        let cross = self.total_weight * other.total_weight / total;
        for i in 0..self.dim {
            let di = other.mean[i] - self.mean[i];
            for j in 0..self.dim {
                let idx = i * self.dim + j;
                let dj = other.mean[j] - self.mean[j];
                self.comoment[idx] += other.comoment[idx] + di * dj * cross;
            }
        }
        let frac = other.total_weight / total;
        izip!(self.mean.iter_mut(), &other.mean).for_each(|(mean, m)| *mean += frac * (m - *mean));
        self.total_weight = total;
        self.total_weight_sq += other.total_weight_sq;
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Kish effective sample size `(sum w)^2 / sum w^2`.
    pub fn effective_samples(&self) -> f64 {
        if self.total_weight_sq == 0. {
            return 0.;
        }
        self.total_weight * self.total_weight / self.total_weight_sq
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Unbiased variance of one coordinate, treating weights as counts.
    pub fn variance(&self, i: usize) -> Option<f64> {
        if self.total_weight <= 1. {
            return None;
        }
        Some(self.comoment[i * self.dim + i] / (self.total_weight - 1.))
    }

    pub fn covariance(&self) -> Option<CovarianceMatrix> {
        if self.total_weight <= 1. {
            return None;
        }
        let norm = (self.total_weight - 1.).recip();
        let mut values: Vec<f64> = self.comoment.iter().map(|c| c * norm).collect();
        // Symmetrize away rounding noise.
        for i in 0..self.dim {
            for j in 0..i {
                let avg = 0.5 * (values[i * self.dim + j] + values[j * self.dim + i]);
                values[i * self.dim + j] = avg;
                values[j * self.dim + i] = avg;
            }
        }
        Some(CovarianceMatrix {
            dim: self.dim,
            values,
            learned_from: self.effective_samples(),
        })
    }
}

/// Estimate a proposal covariance from weighted samples.
///
/// Returns `None` if the effective sample size is below `min_samples`
/// or the estimate is degenerate.
pub(crate) fn learn_covariance(moments: &WeightedMoments, min_samples: f64) -> Option<CovarianceMatrix> {
    if moments.effective_samples() < min_samples {
        return None;
    }
    let cov = moments.covariance()?;
    match cov.validate() {
        Ok(()) => Some(cov),
        Err(err) => {
            log::warn!("Discarding learned covariance: {err}");
            None
        }
    }
}

/// Square root factor `A` of a block's sub-covariance, `A A^T = S`.
#[derive(Debug, Clone)]
pub(crate) struct BlockFactor {
    dim: usize,
    values: Vec<f64>,
}

impl BlockFactor {
    fn new(sub: Mat<f64>) -> Option<Self> {
        let dim = sub.nrows();
        if dim == 1 {
            let var = sub[(0, 0)];
            return (var > 0.).then(|| Self {
                dim,
                values: vec![var.sqrt()],
            });
        }

        let eig = sub.self_adjoint_eigen(faer::Side::Lower).ok()?;
        let u = eig.U();
        let s = eig.S().column_vector();

        let largest = (0..dim).map(|j| s[j]).fold(0f64, f64::max);
        if !(largest > 0.) || (0..dim).any(|j| s[j] < -1e-10 * largest) {
            return None;
        }

        let mut values = vec![0f64; dim * dim];
        for i in 0..dim {
            for j in 0..dim {
                values[i * dim + j] = u[(i, j)] * s[j].max(0.).sqrt();
            }
        }
        values.iter().all(|v| v.is_finite()).then_some(Self { dim, values })
    }

    /// `out = A z`
    pub(crate) fn apply(&self, z: &[f64], out: &mut [f64]) {
        for (i, out) in out.iter_mut().enumerate().take(self.dim) {
            *out = self.values[i * self.dim..(i + 1) * self.dim]
                .iter()
                .zip(z)
                .map(|(a, z)| a * z)
                .sum();
        }
    }
}

/// A covariance together with the per-block factors used to draw
/// proposals. Immutable; chains share it through an `Arc` and replace
/// the whole object when a new covariance is learned.
#[derive(Debug)]
pub struct ProposalCovariance {
    matrix: CovarianceMatrix,
    factors: Vec<BlockFactor>,
}

impl ProposalCovariance {
    pub fn new(matrix: CovarianceMatrix, blocks: &[ParameterBlock]) -> Result<Self> {
        matrix.validate()?;
        let factors = blocks
            .iter()
            .map(|block| {
                BlockFactor::new(matrix.submatrix(block.indices())).ok_or_else(|| {
                    McmcError::Configuration(
                        "covariance matrix is not positive semi-definite".to_string(),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { matrix, factors })
    }

    pub fn matrix(&self) -> &CovarianceMatrix {
        &self.matrix
    }

    pub(crate) fn factor(&self, block: usize) -> &BlockFactor {
        &self.factors[block]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{ParameterDef, ParameterSpace, Prior};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn weighted_moments_match_expanded_samples() {
        let samples = [(vec![1., 2.], 3.), (vec![-1., 0.5], 1.), (vec![4., -2.], 2.)];
        let mut weighted = WeightedMoments::new(2);
        let mut expanded = WeightedMoments::new(2);
        for (x, w) in &samples {
            weighted.add(x, *w);
            for _ in 0..(*w as usize) {
                expanded.add(x, 1.);
            }
        }
        let a = weighted.covariance().unwrap();
        let b = expanded.covariance().unwrap();
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(weighted.effective_samples(), 36. / 14., epsilon = 1e-12);
        assert_abs_diff_eq!(expanded.effective_samples(), 6., epsilon = 1e-12);
    }

    #[test]
    fn merge_into_empty_copies() {
        let mut moments = WeightedMoments::new(2);
        moments.add(&[1., 2.], 2.);
        moments.add(&[-3., 0.], 1.);
        let mut empty = WeightedMoments::new(2);
        empty.merge(&moments);
        assert_eq!(empty, moments);
        moments.merge(&WeightedMoments::new(2));
        assert_eq!(empty, moments);
        assert_abs_diff_eq!(moments.mean()[0], -1. / 3., epsilon = 1e-14);
        assert_abs_diff_eq!(moments.variance(0).unwrap(), 16. / 3., epsilon = 1e-12);
    }

    #[test]
    fn too_few_samples_do_not_learn() {
        let mut moments = WeightedMoments::new(2);
        moments.add(&[0., 0.], 1.);
        moments.add(&[1., 2.], 1.);
        moments.add(&[3., 1.], 1.);
        assert!(learn_covariance(&moments, 4.).is_none());
        assert!(learn_covariance(&moments, 3.).is_some());
    }

    #[test]
    fn factor_reproduces_block_covariance() {
        let space = ParameterSpace::new([
            ParameterDef::sampled("a", Prior::Uniform { min: 0., max: 1. }),
            ParameterDef::sampled("b", Prior::Uniform { min: 0., max: 1. }),
            ParameterDef::sampled("c", Prior::Uniform { min: 0., max: 1. }).with_cost(5.),
        ])
        .unwrap();
        let matrix = CovarianceMatrix::from_rows(&[
            vec![2.0, 0.6, 0.1],
            vec![0.6, 1.0, 0.2],
            vec![0.1, 0.2, 0.5],
        ])
        .unwrap();
        let proposal = ProposalCovariance::new(matrix.clone(), space.blocks()).unwrap();

        // block 0 is the slow parameter `c`
        assert_abs_diff_eq!(proposal.factor(0).values[0], 0.5f64.sqrt(), epsilon = 1e-12);

        let factor = proposal.factor(1);
        let a = &factor.values;
        for (i, j) in [(0, 0), (0, 1), (1, 1)] {
            let prod = a[i * 2] * a[j * 2] + a[i * 2 + 1] * a[j * 2 + 1];
            assert_abs_diff_eq!(prod, matrix.get(i, j), epsilon = 1e-10);
        }
    }

    #[test]
    fn invalid_matrices_are_rejected() {
        assert!(CovarianceMatrix::from_rows(&[vec![1., 0.5], vec![0.4, 1.]]).is_err());
        assert!(CovarianceMatrix::from_rows(&[vec![1., 0.], vec![0., 0.]]).is_err());
        assert!(CovarianceMatrix::from_rows(&[vec![1., 0.]]).is_err());

        let space = ParameterSpace::new([
            ParameterDef::sampled("a", Prior::Uniform { min: 0., max: 1. }),
            ParameterDef::sampled("b", Prior::Uniform { min: 0., max: 1. }),
        ])
        .unwrap();
        let indefinite = CovarianceMatrix::from_rows(&[vec![1., 2.], vec![2., 1.]]).unwrap();
        assert!(ProposalCovariance::new(indefinite, space.blocks()).is_err());
    }

    proptest! {
        #[test]
        fn merge_equals_sequential(
            xs in prop::collection::vec((-10f64..10., -10f64..10., 1u32..5), 2..40),
            split in 0usize..40,
        ) {
            let split = split.min(xs.len());
            let mut all = WeightedMoments::new(2);
            let mut left = WeightedMoments::new(2);
            let mut right = WeightedMoments::new(2);
            for (i, &(a, b, w)) in xs.iter().enumerate() {
                all.add(&[a, b], w as f64);
                if i < split {
                    left.add(&[a, b], w as f64);
                } else {
                    right.add(&[a, b], w as f64);
                }
            }
            left.merge(&right);
            prop_assert!((left.total_weight() - all.total_weight()).abs() < 1e-9);
            for (x, y) in left.mean().iter().zip(all.mean()) {
                prop_assert!((x - y).abs() < 1e-9);
            }
            for (x, y) in left.comoment.iter().zip(&all.comoment) {
                prop_assert!((x - y).abs() < 1e-6 * (1. + y.abs()));
            }
        }
    }
}
