//! Limited-memory BFGS with a backtracking line search.
//!
//! Curvature is approximated from the last few steps and gradient changes
//! through the two-loop recursion. Each iteration searches along the
//! resulting direction, starting from a unit step and shrinking or growing it
//! until the Armijo sufficient-decrease condition and the strong Wolfe
//! curvature condition both hold.

use crate::function::DecomposableFunction;
use crate::optimizer::Optimizer;
use crate::NcaError;
use bon::Builder;
use ndarray::{Array2, ArrayView2, Zip};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

/// Step factor applied when the trial step overshoots.
const DECREASE: f64 = 0.5;

/// Step factor applied when the trial step is too timid.
const INCREASE: f64 = 2.1;

/// Parameters of [`Lbfgs`].
#[derive(Builder, Clone, Copy, Debug)]
pub struct LbfgsParameters {
    /// Number of (step, gradient change) pairs remembered
    #[builder(default = 5)]
    pub num_basis: usize,

    /// Maximum number of iterations; zero means no limit
    #[builder(default = 500_000)]
    pub max_iterations: usize,

    /// Sufficient-decrease constant of the Armijo condition
    #[builder(default = 1e-4)]
    pub armijo_constant: f64,

    /// Curvature constant of the Wolfe condition
    #[builder(default = 0.9)]
    pub wolfe: f64,

    /// Gradient norm below which the run stops
    #[builder(default = 1e-7)]
    pub min_gradient_norm: f64,

    /// Maximum number of trial steps per line search
    #[builder(default = 50)]
    pub max_line_search_trials: usize,

    /// Smallest step the line search will try
    #[builder(default = 1e-20)]
    pub min_step: f64,

    /// Largest step the line search will try
    #[builder(default = 1e20)]
    pub max_step: f64,
}

impl Default for LbfgsParameters {
    fn default() -> Self {
        Self {
            num_basis: 5,
            max_iterations: 500_000,
            armijo_constant: 1e-4,
            wolfe: 0.9,
            min_gradient_norm: 1e-7,
            max_line_search_trials: 50,
            min_step: 1e-20,
            max_step: 1e20,
        }
    }
}

/// L-BFGS minimizer.
#[derive(Clone, Debug, Default)]
pub struct Lbfgs {
    parameters: LbfgsParameters,
}

impl Lbfgs {
    /// Creates the optimizer.
    pub fn new(parameters: LbfgsParameters) -> Self {
        Self { parameters }
    }

    /// Parameters in use.
    pub fn parameters(&self) -> &LbfgsParameters {
        &self.parameters
    }

    /// Searches along `direction` from `coordinates`.
    ///
    /// Returns `Ok(None)` when the direction does not descend or the
    /// objective is flat along it, so no further progress is possible.
    ///
    /// # Errors
    /// * `NcaError::LineSearch` - Every trial step raised the objective or
    ///   produced a non-finite value
    fn line_search(
        &self,
        function: &dyn DecomposableFunction,
        coordinates: ArrayView2<f64>,
        value: f64,
        gradient: &Array2<f64>,
        direction: &Array2<f64>,
    ) -> Result<Option<Trial>, NcaError> {
        let LbfgsParameters {
            armijo_constant,
            wolfe,
            max_line_search_trials,
            min_step,
            max_step,
            ..
        } = self.parameters;

        let initial_slope = inner(gradient, direction);
        if initial_slope >= 0.0 {
            warn!("L-BFGS search direction is not a descent direction; terminating optimization");
            return Ok(None);
        }

        let sufficient_decrease = armijo_constant * initial_slope;
        let mut step_size = 1.0;
        let mut trials = 0_usize;
        let mut best: Option<Trial> = None;

        loop {
            let mut candidate = coordinates.to_owned();
            candidate.scaled_add(step_size, direction);
            let (trial_value, trial_gradient) = function.evaluate_with_gradient(candidate.view());
            trials += 1;

            let width = if trial_value > value + step_size * sufficient_decrease
                || trial_value.is_nan()
            {
                DECREASE
            } else {
                let slope = inner(&trial_gradient, direction);
                if slope < wolfe * initial_slope {
                    INCREASE
                } else if slope > -wolfe * initial_slope {
                    DECREASE
                } else {
                    return Ok(Some(Trial {
                        step_size,
                        value: trial_value,
                        gradient: trial_gradient,
                    }));
                }
            };

            if trial_value < best.as_ref().map_or(f64::INFINITY, |b| b.value) {
                best = Some(Trial {
                    step_size,
                    value: trial_value,
                    gradient: trial_gradient,
                });
            }

            if step_size < min_step || step_size > max_step || trials >= max_line_search_trials {
                break;
            }
            step_size *= width;
        }

        match best {
            Some(best) if best.value < value => {
                warn!(
                    "L-BFGS line search met no acceptance condition in {trials} trials; taking best step {}",
                    best.step_size
                );
                Ok(Some(best))
            }
            Some(best) if best.value <= value => {
                debug!("L-BFGS objective is flat along the search direction");
                Ok(None)
            }
            _ => Err(NcaError::LineSearch { trials }),
        }
    }
}

impl Optimizer for Lbfgs {
    /// Iterates until the gradient norm drops below `min_gradient_norm`, the
    /// iteration budget is spent, or no further progress is possible.
    ///
    /// # Errors
    /// * `NcaError::LineSearch` - A line search found no step that lowers the
    ///   objective
    fn optimize(
        &mut self,
        function: &dyn DecomposableFunction,
        coordinates: &mut Array2<f64>,
    ) -> Result<f64, NcaError> {
        let start_time = Instant::now();
        let LbfgsParameters {
            num_basis,
            max_iterations,
            min_gradient_norm,
            ..
        } = self.parameters;

        let mut memory = LbfgsMemory::new(num_basis);
        let (mut value, mut gradient) = function.evaluate_with_gradient(coordinates.view());
        debug!("Initial objective: {value}");

        let mut iteration = 0_usize;
        loop {
            if max_iterations != 0 && iteration >= max_iterations {
                warn!("L-BFGS: maximum iterations ({max_iterations}) reached; terminating optimization");
                break;
            }

            if !value.is_finite() {
                warn!("L-BFGS: objective is non-finite; terminating optimization");
                break;
            }

            let gradient_norm = inner(&gradient, &gradient).sqrt();
            if gradient_norm < min_gradient_norm {
                debug!("L-BFGS: gradient norm {gradient_norm} below {min_gradient_norm}; converged");
                break;
            }

            let scaling = memory.scaling_factor().unwrap_or(1.0 / gradient_norm);
            let direction = memory.search_direction(&gradient, scaling);

            let Some(trial) =
                self.line_search(function, coordinates.view(), value, &gradient, &direction)?
            else {
                break;
            };

            let step = direction * trial.step_size;
            let previous = coordinates.clone();
            *coordinates += &step;
            if *coordinates == previous {
                debug!("L-BFGS: step no longer changes the coordinates; terminating optimization");
                break;
            }

            memory.update(step, &trial.gradient - &gradient);
            value = trial.value;
            gradient = trial.gradient;
            iteration += 1;

            debug!("Iteration: {iteration:4}, Objective: {value}");
        }

        debug!(
            "L-BFGS finished after {iteration} iterations in {:.2?}, objective {value}",
            start_time.elapsed()
        );
        Ok(value)
    }
}

/// One evaluated point of a line search.
struct Trial {
    step_size: f64,
    value: f64,
    gradient: Array2<f64>,
}

/// Frobenius inner product of two equally shaped matrices.
fn inner(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + x * y)
}

/// L-BFGS memory storage.
struct LbfgsMemory {
    /// Step differences (`s_k = x_{k+1} - x_k`)
    s_list: VecDeque<Array2<f64>>,

    /// Gradient differences (`y_k = g_{k+1} - g_k`)
    y_list: VecDeque<Array2<f64>>,

    /// Curvature estimates (`r_k = 1 / (s_k · y_k)`)
    r_list: VecDeque<f64>,

    /// Maximum number of stored pairs
    max_size: usize,
}

impl LbfgsMemory {
    fn new(max_size: usize) -> Self {
        Self {
            s_list: VecDeque::with_capacity(max_size),
            y_list: VecDeque::with_capacity(max_size),
            r_list: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    fn len(&self) -> usize {
        self.s_list.len()
    }

    /// Remembers a step, dropping the oldest pair when full. Pairs without
    /// positive curvature are skipped to keep the approximation positive
    /// definite.
    fn update(&mut self, s: Array2<f64>, y: Array2<f64>) {
        let sy = inner(&s, &y);
        if self.max_size == 0 || sy <= 1e-10 {
            return;
        }

        if self.s_list.len() >= self.max_size {
            self.s_list.pop_front();
            self.y_list.pop_front();
            self.r_list.pop_front();
        }

        self.s_list.push_back(s);
        self.y_list.push_back(y);
        self.r_list.push_back(1.0 / sy);
    }

    /// Initial inverse Hessian scale `sᵀy / yᵀy` from the newest pair.
    fn scaling_factor(&self) -> Option<f64> {
        let s = self.s_list.back()?;
        let y = self.y_list.back()?;
        let yy = inner(y, y);
        (yy > 0.0).then(|| inner(s, y) / yy)
    }

    /// Two-loop recursion: the negated inverse Hessian approximation applied
    /// to `gradient`.
    fn search_direction(&self, gradient: &Array2<f64>, scaling: f64) -> Array2<f64> {
        let mut q = gradient.clone();
        let mut alpha_list = Vec::with_capacity(self.len());

        // First loop: backward through memory
        for ((s, y), &r) in self
            .s_list
            .iter()
            .zip(self.y_list.iter())
            .zip(self.r_list.iter())
            .rev()
        {
            let alpha = r * inner(s, &q);
            q.scaled_add(-alpha, y);
            alpha_list.push(alpha);
        }
        alpha_list.reverse();

        q *= scaling;

        // Second loop: forward through memory
        for (((s, y), &r), &alpha) in self
            .s_list
            .iter()
            .zip(self.y_list.iter())
            .zip(self.r_list.iter())
            .zip(alpha_list.iter())
        {
            let beta = r * inner(y, &q);
            q.scaled_add(alpha - beta, s);
        }

        -q
    }
}
