//! PCA whitening of feature vectors.
//!
//! Whitening decorrelates features and scales them to unit variance: points
//! are centred, rotated onto the principal axes of their covariance and
//! divided by the square root of each axis' variance. A small regularization
//! term is added to every variance so that flat directions do not blow up.
//!
//! This is independent of the metric learner; it is a common preprocessing
//! step before it.

use crate::NcaError;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use petal_decomposition::Pca;
use std::cmp::min;
use tracing::debug;

/// Default regularization added to every covariance eigenvalue.
pub const DEFAULT_EPSILON: f64 = 5e-5;

/// A fitted PCA whitening transform for points stored as columns.
#[derive(Clone, Debug)]
pub struct PcaWhitening {
    /// Mean of each feature
    mean: Array1<f64>,

    /// Covariance eigenvalues with the regularization already added
    eigenvalues: Array1<f64>,

    /// Principal axes as columns (`D × k`)
    eigenvectors: Array2<f64>,

    /// Regularization parameter
    epsilon: f64,
}

impl PcaWhitening {
    /// Fits the whitening transform to `data` (`D × N`, points as columns).
    ///
    /// At most `min(D, N)` principal axes are kept.
    ///
    /// # Errors
    /// * `NcaError::SampleSize` - Fewer than two points
    /// * `NcaError::Pca` - The decomposition fails
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(data: ArrayView2<f64>, epsilon: f64) -> Result<Self, NcaError> {
        let (dim, n) = data.dim();
        if n < 2 {
            return Err(NcaError::SampleSize);
        }

        let mean = data.mean_axis(Axis(1)).ok_or(NcaError::SampleSize)?;
        let centred = &data - &mean.view().insert_axis(Axis(1));

        let n_components = min(dim, n);
        let mut pca = Pca::new(n_components);
        pca.fit(&centred.t())?;
        let eigenvectors = pca.components().t().to_owned();

        // Variance of the data along each principal axis
        let projected = eigenvectors.t().dot(&centred);
        let eigenvalues = projected
            .map_axis(Axis(1), |axis| axis.dot(&axis) / (n - 1) as f64)
            .mapv(|variance| variance + epsilon);

        debug!("Fitted PCA whitening with {n_components} components");
        Ok(Self {
            mean,
            eigenvalues,
            eigenvectors,
            epsilon,
        })
    }

    /// Fits the transform and whitens the same data.
    ///
    /// # Errors
    /// See [`PcaWhitening::fit`].
    pub fn fit_transform(data: ArrayView2<f64>, epsilon: f64) -> Result<(Self, Array2<f64>), NcaError> {
        let whitening = Self::fit(data, epsilon)?;
        let output = whitening.transform(data)?;
        Ok((whitening, output))
    }

    /// Whitens `data` (`D × N`) into `k × N`.
    ///
    /// # Errors
    /// * `NcaError::DimensionMismatch` - `data` has a different number of
    ///   features than the fitted data
    pub fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, NcaError> {
        self.check_rows(data, self.mean.len())?;

        let centred = &data - &self.mean.view().insert_axis(Axis(1));
        let mut output = self.eigenvectors.t().dot(&centred);
        output /= &self.eigenvalues.mapv(f64::sqrt).insert_axis(Axis(1));
        Ok(output)
    }

    /// Maps whitened points (`k × N`) back to the original feature space.
    ///
    /// # Errors
    /// * `NcaError::DimensionMismatch` - `data` does not have one row per
    ///   kept component
    pub fn inverse_transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, NcaError> {
        self.check_rows(data, self.eigenvalues.len())?;

        let scaled = &data * &self.eigenvalues.mapv(f64::sqrt).insert_axis(Axis(1));
        Ok(self.eigenvectors.dot(&scaled) + &self.mean.view().insert_axis(Axis(1)))
    }

    /// Mean of each feature.
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Covariance eigenvalues, regularized.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Principal axes as columns.
    pub fn eigenvectors(&self) -> &Array2<f64> {
        &self.eigenvectors
    }

    /// Regularization parameter.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn check_rows(&self, data: ArrayView2<f64>, expected: usize) -> Result<(), NcaError> {
        if data.nrows() == expected {
            Ok(())
        } else {
            Err(NcaError::DimensionMismatch {
                expected,
                actual: data.nrows(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Zip};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    /// Correlated three-feature data with very different scales.
    fn correlated(n: usize) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(11);
        let latent = Array2::random_using((3, n), Uniform::new(-1.0, 1.0), &mut rng);
        let mixing = array![[4.0, 0.0, 0.0], [2.0, 1.0, 0.0], [-1.0, 0.5, 0.2]];
        mixing.dot(&latent) + &array![[10.0], [-3.0], [0.5]]
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_whitened_covariance_is_identity() {
        let data = correlated(500);

        let (_, whitened) = PcaWhitening::fit_transform(data.view(), DEFAULT_EPSILON).unwrap();

        let n = whitened.ncols() as f64;
        let mean = whitened.mean_axis(Axis(1)).unwrap();
        let centred = &whitened - &mean.insert_axis(Axis(1));
        let covariance = centred.dot(&centred.t()) / (n - 1.0);

        for ((i, j), &value) in covariance.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(value, expected, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_inverse_recovers_data() {
        let data = correlated(50);

        let (whitening, whitened) = PcaWhitening::fit_transform(data.view(), DEFAULT_EPSILON).unwrap();
        let restored = whitening.inverse_transform(whitened.view()).unwrap();

        Zip::from(&restored).and(&data).for_each(|&a, &b| {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        });
    }

    #[test]
    fn test_mean_and_regularization() {
        let data = array![[1.0, 3.0, 5.0, 7.0], [2.0, 2.0, 2.0, 2.0]];

        let whitening = PcaWhitening::fit(data.view(), 0.5).unwrap();

        assert_abs_diff_eq!(whitening.mean()[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(whitening.mean()[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(whitening.epsilon(), 0.5);
        // Variance of the first feature is 20 / 3; the second is constant
        let mut eigenvalues = whitening.eigenvalues().to_vec();
        eigenvalues.sort_by(f64::total_cmp);
        assert_abs_diff_eq!(eigenvalues[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(eigenvalues[1], 20.0 / 3.0 + 0.5, epsilon = 1e-9);
        assert!(whitening
            .transform(data.view())
            .unwrap()
            .iter()
            .all(|v| v.is_finite()));
    }

    #[test]
    fn test_fewer_points_than_features() {
        let data = array![[0.0, 1.0], [1.0, 0.0], [2.0, 5.0]];

        let whitening = PcaWhitening::fit(data.view(), DEFAULT_EPSILON).unwrap();

        assert_eq!(whitening.eigenvectors().dim(), (3, 2));
        assert_eq!(whitening.transform(data.view()).unwrap().nrows(), 2);
    }

    #[test]
    fn test_rejects_wrong_feature_count() {
        let data = correlated(20);
        let whitening = PcaWhitening::fit(data.view(), DEFAULT_EPSILON).unwrap();

        let result = whitening.transform(array![[1.0, 2.0]].view());

        assert!(matches!(
            result,
            Err(NcaError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_rejects_single_point() {
        let result = PcaWhitening::fit(array![[1.0], [2.0]].view(), DEFAULT_EPSILON);
        assert!(matches!(result, Err(NcaError::SampleSize)));
    }
}
