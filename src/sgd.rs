//! Mini-batch stochastic gradient descent.
//!
//! Every pass visits each of the objective's terms once. Unless a linear scan
//! is requested, the terms are reshuffled at the start of each pass, so the
//! batches are regrouped every time. Each step takes the gradient of one
//! batch and moves the coordinates against it by a fixed step size. Progress
//! is judged per pass: when the summed batch objectives of two consecutive
//! passes differ by less than the tolerance, the run stops.

use crate::function::DecomposableFunction;
use crate::optimizer::Optimizer;
use crate::NcaError;
use bon::Builder;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::time::Instant;
use tracing::{debug, warn};

/// Parameters of [`StochasticGradientDescent`].
#[derive(Builder, Clone, Copy, Debug)]
pub struct SgdParameters {
    /// Step size applied to every batch gradient
    #[builder(default = 0.01)]
    pub step_size: f64,

    /// Number of terms per batch
    #[builder(default = 50)]
    pub batch_size: usize,

    /// Maximum number of terms visited, counting each point of a batch; zero
    /// means no limit
    #[builder(default = 500_000)]
    pub max_iterations: usize,

    /// Minimum change of the per-pass objective required to keep going
    #[builder(default = 1e-7)]
    pub tolerance: f64,

    /// Whether terms are reshuffled into new batches every pass
    #[builder(default = true)]
    pub shuffle: bool,
}

impl Default for SgdParameters {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            batch_size: 50,
            max_iterations: 500_000,
            tolerance: 1e-7,
            shuffle: true,
        }
    }
}

/// Mini-batch stochastic gradient descent with an explicit random source.
#[derive(Clone, Debug)]
pub struct StochasticGradientDescent {
    parameters: SgdParameters,
    rng: SmallRng,
}

impl StochasticGradientDescent {
    /// Creates the optimizer; `rng` drives batch shuffling only.
    pub fn new(parameters: SgdParameters, rng: SmallRng) -> Self {
        Self { parameters, rng }
    }

    /// Parameters in use.
    pub fn parameters(&self) -> &SgdParameters {
        &self.parameters
    }
}

impl Optimizer for StochasticGradientDescent {
    /// Runs passes over the batches until the per-pass objective settles or
    /// the iteration budget runs out. Never fails; non-convergence is logged
    /// and the current coordinates are kept.
    fn optimize(
        &mut self,
        function: &dyn DecomposableFunction,
        coordinates: &mut Array2<f64>,
    ) -> Result<f64, NcaError> {
        let start_time = Instant::now();
        let SgdParameters {
            step_size,
            batch_size,
            max_iterations,
            tolerance,
            shuffle,
        } = self.parameters;

        let n = function.num_functions();
        if n == 0 {
            return Ok(function.evaluate(coordinates.view()));
        }

        if batch_size == 0 {
            warn!("SGD batch size of 0 is not usable; visiting one point per step instead");
        }
        let batch_size = batch_size.clamp(1, n);
        let max_iterations = if max_iterations == 0 {
            usize::MAX
        } else {
            max_iterations
        };

        // Batches are consecutive chunks of this order; the last may be short
        let mut visitation_order: Vec<usize> = (0..n).collect();

        let mut iterations = 0_usize;
        let mut pass = 0_usize;
        let mut last_objective = f64::MAX;

        'passes: loop {
            if shuffle {
                visitation_order.shuffle(&mut self.rng);
            }
            let mut pass_objective = 0.0;

            for batch in visitation_order.chunks(batch_size) {
                if iterations >= max_iterations {
                    warn!("SGD: maximum iterations ({max_iterations}) reached; terminating optimization");
                    break 'passes;
                }

                let (objective, gradient) =
                    function.evaluate_with_gradient_terms(coordinates.view(), batch);
                pass_objective += objective;

                take_step(coordinates.view_mut(), gradient.view(), step_size);
                iterations += batch.len();
            }

            pass += 1;
            debug!("Pass: {pass:4}, Objective: {pass_objective}");

            if !pass_objective.is_finite() {
                warn!("SGD: objective became non-finite after {pass} passes; terminating optimization");
                break;
            }

            if (last_objective - pass_objective).abs() < tolerance {
                debug!("SGD: objective changed by less than {tolerance}; terminating optimization");
                break;
            }

            last_objective = pass_objective;
        }

        let objective = function.evaluate(coordinates.view());
        debug!(
            "SGD finished after {iterations} iterations in {:.2?}, objective {objective}",
            start_time.elapsed()
        );
        Ok(objective)
    }
}

/// Moves `coordinates` against `gradient` by `step_size`.
fn take_step(mut coordinates: ArrayViewMut2<f64>, gradient: ArrayView2<f64>, step_size: f64) {
    coordinates.scaled_add(-step_size, &gradient);
}
