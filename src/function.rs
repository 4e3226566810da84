//! Objective/gradient contract shared by every optimizer.
//!
//! A [`DecomposableFunction`] is a sum of `num_functions()` independently
//! evaluable terms. Full-batch optimizers such as L-BFGS only ask for the
//! whole sum; stochastic optimizers walk over contiguous batches of terms.
//! [`SoftmaxErrorFunction`] is the NCA objective expressed in this form, with
//! one term per anchor point.

use crate::distance::DistanceCache;
use crate::softmax::{soft_accuracy, soft_accuracy_gradient};
use crate::NcaError;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use std::cmp::min;
use std::ops::Range;

/// A differentiable objective made of separable terms, to be minimized.
///
/// Batches are contiguous runs of terms starting at `begin`. A batch that runs
/// past the last term is truncated. Evaluating every batch of size one and
/// summing the results gives the full-batch value, up to floating-point
/// accumulation order, and the same holds for gradients.
pub trait DecomposableFunction {
    /// Number of separable terms.
    fn num_functions(&self) -> usize;

    /// Objective over terms `begin..begin + batch_size`.
    fn evaluate_batch(&self, coordinates: ArrayView2<f64>, begin: usize, batch_size: usize) -> f64;

    /// Gradient of [`evaluate_batch`](Self::evaluate_batch), shaped like
    /// `coordinates`.
    fn gradient_batch(
        &self,
        coordinates: ArrayView2<f64>,
        begin: usize,
        batch_size: usize,
    ) -> Array2<f64>;

    /// Objective and gradient over a batch in one pass.
    fn evaluate_with_gradient_batch(
        &self,
        coordinates: ArrayView2<f64>,
        begin: usize,
        batch_size: usize,
    ) -> (f64, Array2<f64>) {
        (
            self.evaluate_batch(coordinates, begin, batch_size),
            self.gradient_batch(coordinates, begin, batch_size),
        )
    }

    /// Objective and gradient over an arbitrary set of terms, given by index.
    ///
    /// Stochastic optimizers use this to regroup terms between passes. The
    /// default sums single-term batches; implementations with a cheaper
    /// grouped evaluation should override it.
    fn evaluate_with_gradient_terms(
        &self,
        coordinates: ArrayView2<f64>,
        terms: &[usize],
    ) -> (f64, Array2<f64>) {
        terms.iter().fold(
            (0.0, Array2::zeros(coordinates.dim())),
            |(value, mut gradient), &term| {
                let (term_value, term_gradient) =
                    self.evaluate_with_gradient_batch(coordinates, term, 1);
                gradient += &term_gradient;
                (value + term_value, gradient)
            },
        )
    }

    /// Objective over every term.
    fn evaluate(&self, coordinates: ArrayView2<f64>) -> f64 {
        self.evaluate_batch(coordinates, 0, self.num_functions())
    }

    /// Gradient over every term.
    fn gradient(&self, coordinates: ArrayView2<f64>) -> Array2<f64> {
        self.gradient_batch(coordinates, 0, self.num_functions())
    }

    /// Objective and gradient over every term in one pass.
    fn evaluate_with_gradient(&self, coordinates: ArrayView2<f64>) -> (f64, Array2<f64>) {
        self.evaluate_with_gradient_batch(coordinates, 0, self.num_functions())
    }
}

/// Negated NCA soft accuracy over a labeled dataset.
///
/// The value is `-Σ_i p_i`, so it lies in `[-N, 0]` and lower is better. The
/// coordinates passed in are the `D × D` transformation `A`. Nothing is
/// cached between calls; distances and soft neighbor distributions are
/// rebuilt for every request.
#[derive(Debug, Clone, Copy)]
pub struct SoftmaxErrorFunction<'a> {
    /// Points as columns (`D × N`)
    dataset: ArrayView2<'a, f64>,

    /// Dense class id per point
    labels: ArrayView1<'a, usize>,
}

impl<'a> SoftmaxErrorFunction<'a> {
    /// Binds the objective to a dataset and its labels.
    ///
    /// # Arguments
    /// * `dataset` - Points as columns (`D × N`)
    /// * `labels` - One class id per point
    ///
    /// # Errors
    /// * `NcaError::LabelCountMismatch` - Label and point counts differ
    /// * `NcaError::SampleSize` - Fewer than two points
    pub fn new(dataset: ArrayView2<'a, f64>, labels: ArrayView1<'a, usize>) -> Result<Self, NcaError> {
        if labels.len() != dataset.ncols() {
            return Err(NcaError::LabelCountMismatch {
                labels: labels.len(),
                points: dataset.ncols(),
            });
        }

        if dataset.ncols() <= 1 {
            return Err(NcaError::SampleSize);
        }

        Ok(Self { dataset, labels })
    }

    /// Dimensionality of the points, and therefore of `A`.
    pub fn dimensions(&self) -> usize {
        self.dataset.nrows()
    }

    /// Anchor range for a batch, truncated to the dataset.
    fn anchors(&self, begin: usize, batch_size: usize) -> Range<usize> {
        let n = self.dataset.ncols();
        let begin = min(begin, n);
        begin..min(begin.saturating_add(batch_size), n)
    }

    /// Objective and gradient for any parallel iterator of anchors.
    fn evaluate_with_gradient_anchors<I>(
        &self,
        coordinates: ArrayView2<f64>,
        anchors: I,
    ) -> (f64, Array2<f64>)
    where
        I: IntoParallelIterator<Item = usize>,
    {
        debug_assert_eq!(coordinates.dim(), (self.dimensions(), self.dimensions()));

        let cache = DistanceCache::new(coordinates, self.dataset);
        let (mass, kernel) = soft_accuracy_gradient(self.dataset, &cache, self.labels, anchors);

        (-mass, Self::gradient_from_kernel(coordinates, &kernel))
    }

    /// Gradient of the negated objective from the kernel `Σ c·Δx·Δxᵀ`.
    fn gradient_from_kernel(coordinates: ArrayView2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
        coordinates.dot(kernel) * -2.0
    }
}

impl DecomposableFunction for SoftmaxErrorFunction<'_> {
    fn num_functions(&self) -> usize {
        self.dataset.ncols()
    }

    fn evaluate_batch(&self, coordinates: ArrayView2<f64>, begin: usize, batch_size: usize) -> f64 {
        debug_assert_eq!(coordinates.dim(), (self.dimensions(), self.dimensions()));

        let cache = DistanceCache::new(coordinates, self.dataset);
        -soft_accuracy(&cache, self.labels, self.anchors(begin, batch_size))
    }

    fn gradient_batch(
        &self,
        coordinates: ArrayView2<f64>,
        begin: usize,
        batch_size: usize,
    ) -> Array2<f64> {
        self.evaluate_with_gradient_batch(coordinates, begin, batch_size).1
    }

    fn evaluate_with_gradient_batch(
        &self,
        coordinates: ArrayView2<f64>,
        begin: usize,
        batch_size: usize,
    ) -> (f64, Array2<f64>) {
        self.evaluate_with_gradient_anchors(coordinates, self.anchors(begin, batch_size))
    }

    fn evaluate_with_gradient_terms(
        &self,
        coordinates: ArrayView2<f64>,
        terms: &[usize],
    ) -> (f64, Array2<f64>) {
        debug_assert!(terms.iter().all(|&t| t < self.num_functions()));
        self.evaluate_with_gradient_anchors(coordinates, terms.par_iter().copied())
    }
}
