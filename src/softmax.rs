//! Stochastic neighbor assignment for the NCA objective.
//!
//! Each anchor point picks a neighbor at random with probability proportional
//! to `exp(-d(i, j))`, where `d` is the squared distance under the current
//! transformation. The probability mass an anchor places on neighbors of its
//! own class is a differentiable stand-in for leave-one-out nearest neighbor
//! accuracy; summing it over anchors gives the quantity NCA maximizes.
//!
//! The gradient of that sum with respect to the transformation `A` is
//!
//! ```text
//! 2·A·Σ_i Σ_j c(i,j)·Δx_ij·Δx_ijᵀ,   c(i,j) = p(i,j)·(p_i − [label(j) = label(i)])
//! ```
//!
//! This module computes the scalar and the inner sum `Σ c·Δx·Δxᵀ`; applying
//! `A` and the sign convention is left to the caller.

use crate::distance::DistanceCache;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::warn;

/// Soft neighbor distribution of a single anchor point.
#[derive(Debug, Clone)]
pub struct SoftNeighbors {
    /// `p(i, j)` for every point `j`, zero at the anchor itself
    pub probabilities: Array1<f64>,

    /// `p_i`: total probability on neighbors sharing the anchor's label
    pub same_class_mass: f64,
}

/// Turns an anchor's squared distances into its soft neighbor distribution.
///
/// Returns `None` when every affinity underflows to zero, which happens when
/// the anchor is far from all other points under the current transformation.
/// The caller decides how to account for such an anchor.
///
/// # Arguments
/// * `distances` - Squared distances from the anchor to every point
/// * `anchor` - Index of the anchor point
/// * `labels` - Class label of every point
pub fn soft_neighbors(
    distances: ArrayView1<f64>,
    anchor: usize,
    labels: ArrayView1<usize>,
) -> Option<SoftNeighbors> {
    let mut probabilities = distances.mapv(|d| (-d).exp());
    probabilities[anchor] = 0.0;

    let denominator = probabilities.sum();
    if denominator.is_nan() || denominator <= 0.0 {
        return None;
    }
    probabilities /= denominator;

    let anchor_label = labels[anchor];
    let same_class_mass = Zip::from(&probabilities)
        .and(labels)
        .fold(0.0, |mass, &p, &label| {
            if label == anchor_label {
                mass + p
            } else {
                mass
            }
        });

    Some(SoftNeighbors {
        probabilities,
        same_class_mass,
    })
}

/// Soft neighbor distribution of `anchor`, with the zero-denominator case
/// reported and mapped to `None`.
fn anchor_neighbors(
    cache: &DistanceCache,
    anchor: usize,
    labels: ArrayView1<usize>,
) -> Option<SoftNeighbors> {
    let neighbors = soft_neighbors(cache.distances_from(anchor).view(), anchor, labels);
    if neighbors.is_none() {
        warn!("Denominator of p_{anchor} is 0; the point contributes nothing this evaluation");
    }
    neighbors
}

/// Sums `p_i` over a set of anchors, such as a contiguous range or a
/// shuffled batch of indices.
///
/// Anchors whose softmax denominator underflows contribute zero.
pub fn soft_accuracy<I>(cache: &DistanceCache, labels: ArrayView1<usize>, anchors: I) -> f64
where
    I: IntoParallelIterator<Item = usize>,
{
    anchors
        .into_par_iter()
        .map(|anchor| anchor_neighbors(cache, anchor, labels).map_or(0.0, |n| n.same_class_mass))
        .sum()
}

/// Sums `p_i` over a set of anchors together with the gradient
/// kernel `Σ_i Σ_j c(i,j)·Δx_ij·Δx_ijᵀ`.
///
/// The difference vectors are taken in the original feature space, so the
/// kernel is `D × D`. Anchors are processed in parallel, each thread folding
/// into its own accumulator before the partial sums are reduced.
///
/// # Arguments
/// * `dataset` - Points as columns (`D × N`)
/// * `cache` - Distances under the current transformation
/// * `labels` - Class label of every point
/// * `anchors` - Anchor indices to include, each at most once
///
/// # Returns
/// A tuple containing:
/// - The summed same-class mass of the anchors
/// - The `D × D` gradient kernel
pub fn soft_accuracy_gradient<I>(
    dataset: ArrayView2<f64>,
    cache: &DistanceCache,
    labels: ArrayView1<usize>,
    anchors: I,
) -> (f64, Array2<f64>)
where
    I: IntoParallelIterator<Item = usize>,
{
    debug_assert_eq!(cache.len(), dataset.ncols());
    let dim = dataset.nrows();

    anchors
        .into_par_iter()
        .fold(
            || (0.0, Array2::zeros((dim, dim))),
            |(mass, mut kernel), anchor| {
                let Some(neighbors) = anchor_neighbors(cache, anchor, labels) else {
                    return (mass, kernel);
                };

                accumulate_kernel(dataset, labels, anchor, &neighbors, &mut kernel);
                (mass + neighbors.same_class_mass, kernel)
            },
        )
        .reduce(
            || (0.0, Array2::zeros((dim, dim))),
            |(mass1, mut kernel1), (mass2, kernel2)| {
                kernel1 += &kernel2;
                (mass1 + mass2, kernel1)
            },
        )
}

/// Adds one anchor's `Σ_j c(i,j)·Δx_ij·Δx_ijᵀ` into `kernel`.
fn accumulate_kernel(
    dataset: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    anchor: usize,
    neighbors: &SoftNeighbors,
    kernel: &mut Array2<f64>,
) {
    let anchor_label = labels[anchor];
    let p_i = neighbors.same_class_mass;

    // c(i,j) = p(i,j)·(p_i − [same class])
    let coefficients: Array1<f64> = Zip::from(&neighbors.probabilities)
        .and(labels)
        .map_collect(|&p, &label| {
            if label == anchor_label {
                p * (p_i - 1.0)
            } else {
                p * p_i
            }
        });

    let differences = &dataset - &dataset.column(anchor).insert_axis(Axis(1));
    let weighted = &differences * &coefficients;
    general_mat_mul(1.0, &weighted, &differences.t(), 1.0, kernel);
}
