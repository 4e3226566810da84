//! Pairwise squared distances under a candidate NCA transformation.
//!
//! Points are projected through the transformation once per evaluation, and
//! distances are taken between projected points, so every distance is
//! `||A·(x_i - x_j)||²` computed from the difference of projections rather
//! than from an expanded Gram matrix. It includes functions for:
//!
//! - Computing squared Euclidean distances between vectors using SIMD
//! - Handling both contiguous and non-contiguous array views
//! - Caching the projected dataset for one objective/gradient request

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::warn;
use wide::f64x4;

/// Squared distances between points projected through one transformation.
///
/// Built fresh for every objective or gradient request, since the
/// transformation changes between optimizer calls. Full-batch and mini-batch
/// evaluation share it.
pub struct DistanceCache {
    /// Projected points, one per row (`N × D`), so each point is contiguous
    projected: Array2<f64>,
}

impl DistanceCache {
    /// Projects every point of `dataset` (`D × N`, points as columns) through
    /// `transformation` (`D × D`).
    pub fn new(transformation: ArrayView2<f64>, dataset: ArrayView2<f64>) -> Self {
        // (A·X)ᵀ = Xᵀ·Aᵀ; the product of two transposed views comes out
        // column-major, so rows must be made contiguous explicitly
        let projected = dataset
            .t()
            .dot(&transformation.t())
            .as_standard_layout()
            .into_owned();
        Self { projected }
    }

    /// Number of projected points.
    pub fn len(&self) -> usize {
        self.projected.nrows()
    }

    /// Squared transformed distance between points `i` and `j`.
    pub fn distance(&self, i: usize, j: usize) -> f64 {
        array_squared_distance(self.projected.row(i), self.projected.row(j))
    }

    /// Squared transformed distances from `anchor` to every point, including
    /// the zero distance to itself.
    pub fn distances_from(&self, anchor: usize) -> Array1<f64> {
        (0..self.len()).map(|j| self.distance(anchor, j)).collect()
    }
}

/// Computes squared Euclidean distance between vectors using SIMD operations.
///
/// Processes vectors in chunks of 4 elements using SIMD instructions for
/// improved performance. Handles remaining elements sequentially.
///
/// # Arguments
/// * `a` - First vector
/// * `b` - Second vector
///
/// # Panics
/// * If vectors have different lengths
pub fn simd_squared_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(4);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(4);
    let b_remainder = b_chunks.remainder();

    // Process 4 elements at a time using SIMD
    let mut sum_sq = f64x4::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let a_lane = f64x4::from([a_chunk[0], a_chunk[1], a_chunk[2], a_chunk[3]]);
        let b_lane = f64x4::from([b_chunk[0], b_chunk[1], b_chunk[2], b_chunk[3]]);
        let diff = a_lane - b_lane;
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f64 = sum_sq.as_array_ref().iter().sum();

    // Handle remaining elements sequentially
    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Computes squared Euclidean distance between array views with optimized
/// path for contiguous data.
///
/// Attempts to use SIMD operations on contiguous memory first, falling back to
/// slower methods for non-contiguous data with appropriate warnings.
pub fn array_squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    match (a.as_slice(), b.as_slice()) {
        (Some(a), Some(b)) => simd_squared_distance(a, b),
        (Some(a), None) => {
            warn!("b is non-contiguous, requiring allocation to compute distance");
            simd_squared_distance(a, &b.to_vec())
        }
        (None, Some(b)) => {
            warn!("a is non-contiguous, requiring allocation to compute distance");
            simd_squared_distance(&a.to_vec(), b)
        }
        (None, None) => {
            warn!("both a and b are non-contiguous, requiring allocation to compute distance");
            simd_squared_distance(&a.to_vec(), &b.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    mod cache {
        use crate::distance::DistanceCache;
        use approx::assert_abs_diff_eq;
        use ndarray::{array, Array2};

        #[test]
        fn test_identity_matches_plain_distance() {
            // Points as columns: (0, 0), (3, 4), (1, 1)
            let dataset = array![[0.0, 3.0, 1.0], [0.0, 4.0, 1.0]];
            let cache = DistanceCache::new(Array2::eye(2).view(), dataset.view());

            assert_eq!(cache.len(), 3);
            assert!(cache.projected.is_standard_layout());
            assert_abs_diff_eq!(cache.distance(0, 1), 25.0);
            assert_abs_diff_eq!(cache.distance(0, 2), 2.0);
            assert_abs_diff_eq!(cache.distance(1, 2), 13.0);
        }

        #[test]
        fn test_transformation_scales_difference() {
            let dataset = array![[0.0, 1.0], [0.0, 1.0]];
            // Stretch the first axis by 2 and drop the second
            let transformation = array![[2.0, 0.0], [0.0, 0.0]];
            let cache = DistanceCache::new(transformation.view(), dataset.view());

            assert_abs_diff_eq!(cache.distance(0, 1), 4.0);
        }

        #[test]
        fn test_distances_from_anchor() {
            let dataset = array![[0.0, 1.0, 2.0]];
            let transformation = array![[3.0]];
            let cache = DistanceCache::new(transformation.view(), dataset.view());

            let distances = cache.distances_from(1);
            assert_eq!(distances, array![9.0, 0.0, 9.0]);
        }

        #[test]
        fn test_non_square_mixing() {
            // A mixes the two features: A·Δx = (Δx0 + Δx1, Δx0 - Δx1)
            let dataset = array![[1.0, 0.0], [0.0, 2.0]];
            let transformation = array![[1.0, 1.0], [1.0, -1.0]];
            let cache = DistanceCache::new(transformation.view(), dataset.view());

            // Δx = (1, -2) → A·Δx = (-1, 3) → 10
            assert_abs_diff_eq!(cache.distance(0, 1), 10.0, epsilon = 1e-12);
        }
    }

    /// Tests for squared Euclidean distance calculations
    mod squared {
        use crate::distance::{array_squared_distance, simd_squared_distance};
        use ndarray::array;
        use quickcheck::{Arbitrary, Gen, TestResult};
        use quickcheck_macros::quickcheck;

        #[test]
        fn test_strided_views() {
            let m = array![[1.0, 2.0], [4.0, 6.0]];
            // Columns (1, 4) and (2, 6) are non-contiguous in a standard-layout
            // array
            let d = array_squared_distance(m.column(0), m.column(1));
            assert!((d - 5.0).abs() < 1e-12, "distance was {d}");

            let contiguous = simd_squared_distance(&[1.0, 4.0], &[2.0, 6.0]);
            assert!((d - contiguous).abs() < 1e-12, "{d} != {contiguous}");
        }

        /// Test type for QuickCheck property testing of vector pairs.
        ///
        /// Generates pairs of vectors with same length containing only
        /// moderate finite values.
        #[derive(Clone, Debug)]
        struct VecPair(Vec<f64>, Vec<f64>);

        impl Arbitrary for VecPair {
            fn arbitrary(g: &mut Gen) -> VecPair {
                let len = u8::arbitrary(g) as usize;
                let value = |g: &mut Gen| f64::from(i32::arbitrary(g) % 10_000) / 100.0;
                let a: Vec<_> = (0..len).map(|_| value(g)).collect();
                let b: Vec<_> = (0..len).map(|_| value(g)).collect();
                VecPair(a, b)
            }
        }

        /// Reference implementation of squared Euclidean distance for testing.
        fn standard_squared_distance(a: &[f64], b: &[f64]) -> f64 {
            a.iter()
                .zip(b.iter())
                .map(|(a_i, b_i)| (a_i - b_i).powi(2))
                .sum()
        }

        #[quickcheck]
        fn non_negative(pair: VecPair) -> bool {
            let VecPair(a, b) = pair;
            simd_squared_distance(&a, &b) >= 0.0
        }

        #[quickcheck]
        fn zero_when_equal(pair: VecPair) -> bool {
            let VecPair(a, _) = pair;
            simd_squared_distance(&a, &a) == 0.0
        }

        #[quickcheck]
        fn distance_symmetry(pair: VecPair) -> TestResult {
            let VecPair(a, b) = pair;
            let d1 = simd_squared_distance(&a, &b);
            let d2 = simd_squared_distance(&b, &a);
            let difference = (d1 - d2).abs();

            if difference > 1e-9 * d1.max(1.0) {
                TestResult::error(format!("difference is {difference}"))
            } else {
                TestResult::passed()
            }
        }

        #[quickcheck]
        fn correctness(pair: VecPair) -> TestResult {
            let VecPair(a, b) = pair;
            let simd_result = simd_squared_distance(&a, &b);
            let standard_result = standard_squared_distance(&a, &b);
            let difference = (simd_result - standard_result).abs();

            if difference > 1e-9 * standard_result.max(1.0) {
                TestResult::error(format!("difference is {difference}"))
            } else {
                TestResult::passed()
            }
        }
    }
}
