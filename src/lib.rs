#![allow(clippy::multiple_crate_versions)]

//! # NCA: Neighborhood Components Analysis
//!
//! This crate provides a Rust implementation of Neighborhood Components
//! Analysis, a metric learning technique that finds a linear transformation
//! of the feature space under which nearest neighbor classification works
//! better.
//!
//! NCA replaces the hard choice of a nearest neighbor with a stochastic one:
//! every point picks a neighbor with probability decreasing exponentially in
//! the squared distance under the transformation `A`. The expected number of
//! points whose chosen neighbor shares their class is smooth in `A`, so it can
//! be maximized with any gradient-based optimizer. The learned `A` defines the
//! Mahalanobis distance `d(x, y) = ||A·(x − y)||²`.
//!
//! ## Key Features
//!
//! - Exact objective and gradient, evaluable over the full dataset or any
//!   contiguous batch of anchor points through [`DecomposableFunction`]
//! - Two interchangeable optimizers behind one [`Optimizer`] trait:
//!   mini-batch stochastic gradient descent and L-BFGS with a backtracking
//!   Armijo/Wolfe line search
//! - Identity or range-normalized starting point
//! - Label helpers, delimited text I/O and PCA whitening for preprocessing
//!
//! ## Examples
//!
//! Basic usage with default parameters:
//! ```rust,no_run
//! use ndarray::{Array1, Array2};
//! use nca::{learn_distance, Configuration};
//!
//! // Points as columns, one label per point
//! let data: Array2<f64> = // ... load your labeled data
//! # Array2::zeros((4, 100));
//! let labels: Array1<usize> = // ... class ids in 0..C
//! # Array1::zeros(100);
//! let transformation = learn_distance(data.view(), labels.view(), &Configuration::default()).unwrap();
//! ```
//!
//! Switching to L-BFGS from a normalized start:
//! ```rust,no_run
//! use nca::{Configuration, OptimizerKind};
//!
//! let config = Configuration::builder()
//!     .optimizer(OptimizerKind::Lbfgs)
//!     .normalize(true)
//!     .max_iterations(200)
//!     .num_basis(10)
//!     .build();
//! ```
//!
//! ## Configuration
//!
//! Shared parameters:
//! - `optimizer`: `Sgd` (default) or `Lbfgs`
//! - `max_iterations`: Iteration budget, 0 for no limit (default: 500 000).
//!   For SGD one iteration is one point, so a full pass over the data is
//!   `N` iterations
//! - `tolerance`: For SGD, the minimum change of the per-pass objective; for
//!   L-BFGS, the gradient norm at which to stop (default: 1e-7)
//! - `normalize`: Start from a diagonal of inverse feature ranges instead of
//!   the identity (default: false)
//! - `seed`: Seed for batch shuffling; `None` uses the current time
//!
//! SGD parameters: `step_size` (0.01), `batch_size` (50), `linear_scan`
//! (false).
//!
//! L-BFGS parameters: `num_basis` (5), `armijo_constant` (1e-4), `wolfe`
//! (0.9), `max_line_search_trials` (50), `min_step` (1e-20), `max_step`
//! (1e20).
//!
//! ## Implementation Notes
//!
//! - The objective is non-convex; results depend on the starting point,
//!   optimizer parameters and seed
//! - Anchors whose soft neighbor distribution underflows contribute nothing
//!   and are reported with a warning; if this happens often, use `normalize`
//!   or a smaller step size
//! - Per-anchor work is spread over threads via rayon
//!
//! ## References
//!
//! [Neighbourhood Components Analysis](https://papers.nips.cc/paper/2566-neighbourhood-components-analysis).
//! Goldberger, J., Roweis, S., Hinton, G., & Salakhutdinov, R. (2004).
//! Advances in Neural Information Processing Systems 17.

// Submodule imports
mod distance;
mod function;
pub mod io;
pub mod labels;
mod lbfgs;
mod optimizer;
mod sgd;
mod softmax;
pub mod whitening;

#[cfg(test)]
mod tests;

use bon::Builder;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use petal_decomposition::DecompositionError;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn, Level};

pub use crate::function::{DecomposableFunction, SoftmaxErrorFunction};
pub use crate::lbfgs::{Lbfgs, LbfgsParameters};
pub use crate::optimizer::{Optimizer, OptimizerKind};
pub use crate::sgd::{SgdParameters, StochasticGradientDescent};

/// Configuration options for learning an NCA distance.
///
/// Parameters belonging to the strategy that is not selected are ignored.
#[derive(Builder, Clone, Debug)]
pub struct Configuration {
    /// Optimization strategy
    #[builder(default)]
    pub optimizer: OptimizerKind,

    /// Maximum number of iterations, 0 for no limit
    #[builder(default = 500_000)]
    pub max_iterations: usize,

    /// Termination tolerance: per-pass objective change for SGD, gradient
    /// norm for L-BFGS
    #[builder(default = 1e-7)]
    pub tolerance: f64,

    /// Step size for SGD
    #[builder(default = 0.01)]
    pub step_size: f64,

    /// Batch size for SGD
    #[builder(default = 50)]
    pub batch_size: usize,

    /// Visit SGD batches in order instead of shuffling them
    #[builder(default = false)]
    pub linear_scan: bool,

    /// Number of memory points stored by L-BFGS
    #[builder(default = 5)]
    pub num_basis: usize,

    /// Armijo constant for the L-BFGS line search
    #[builder(default = 1e-4)]
    pub armijo_constant: f64,

    /// Wolfe condition parameter for the L-BFGS line search
    #[builder(default = 0.9)]
    pub wolfe: f64,

    /// Maximum number of line search trials per L-BFGS iteration
    #[builder(default = 50)]
    pub max_line_search_trials: usize,

    /// Minimum line search step for L-BFGS
    #[builder(default = 1e-20)]
    pub min_step: f64,

    /// Maximum line search step for L-BFGS
    #[builder(default = 1e20)]
    pub max_step: f64,

    /// Start from a diagonal of inverse feature ranges instead of the identity
    #[builder(default = false)]
    pub normalize: bool,

    /// Optional random seed for reproducible shuffling
    pub seed: Option<u64>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::default(),
            max_iterations: 500_000,
            tolerance: 1e-7,
            step_size: 0.01,
            batch_size: 50,
            linear_scan: false,
            num_basis: 5,
            armijo_constant: 1e-4,
            wolfe: 0.9,
            max_line_search_trials: 50,
            min_step: 1e-20,
            max_step: 1e20,
            normalize: false,
            seed: None,
        }
    }
}

impl Configuration {
    /// SGD parameters carried by this configuration.
    pub fn sgd_parameters(&self) -> SgdParameters {
        SgdParameters {
            step_size: self.step_size,
            batch_size: self.batch_size,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            shuffle: !self.linear_scan,
        }
    }

    /// L-BFGS parameters carried by this configuration.
    pub fn lbfgs_parameters(&self) -> LbfgsParameters {
        LbfgsParameters {
            num_basis: self.num_basis,
            max_iterations: self.max_iterations,
            armijo_constant: self.armijo_constant,
            wolfe: self.wolfe,
            min_gradient_norm: self.tolerance,
            max_line_search_trials: self.max_line_search_trials,
            min_step: self.min_step,
            max_step: self.max_step,
        }
    }

    /// Builds the selected optimizer. The random source is only consumed by
    /// SGD.
    pub fn build_optimizer(&self, rng: SmallRng) -> Box<dyn Optimizer> {
        match self.optimizer {
            OptimizerKind::Sgd => Box::new(StochasticGradientDescent::new(self.sgd_parameters(), rng)),
            OptimizerKind::Lbfgs => Box::new(Lbfgs::new(self.lbfgs_parameters())),
        }
    }
}

/// Learns an NCA transformation for labeled data.
///
/// # Arguments
/// * `data` - Input data matrix where each column is a point (`D × N`)
/// * `labels` - Class id of each point, in `0..C`
/// * `config` - Configuration options controlling the optimization
///
/// # Returns
/// The learned `D × D` transformation `A`
///
/// # Errors
/// * `NcaError::LabelCountMismatch` - Label and point counts differ
/// * `NcaError::SampleSize` - Input has fewer than two points
/// * `NcaError::LineSearch` - L-BFGS found no step that lowers the objective
pub fn learn_distance<'a>(
    data: ArrayView2<'a, f64>,
    labels: ArrayView1<'a, usize>,
    config: &Configuration,
) -> Result<Array2<f64>, NcaError> {
    let start_time = Instant::now();
    let function = SoftmaxErrorFunction::new(data, labels)?;

    let mut transformation = initial_transformation(data, config.normalize);
    if config.normalize {
        info!("Using normalized starting point for optimization");
    }

    let seed = config.seed.unwrap_or_else(time_seed);
    debug!("Optimizing with {} (seed {seed})", config.optimizer);

    let mut optimizer = config.build_optimizer(SmallRng::seed_from_u64(seed));
    if tracing::enabled!(Level::DEBUG) {
        debug!("Initial objective: {}", function.evaluate(transformation.view()));
    }
    let objective = optimizer.optimize(&function, &mut transformation)?;

    debug!("Final objective: {objective}");
    debug!("Elapsed time: {:.2?}", start_time.elapsed());
    Ok(transformation)
}

/// Starting transformation for the optimizer.
///
/// Either the identity or, when `normalize` is set, a diagonal of inverse
/// per-feature ranges so that every feature spans unit width. A feature with
/// zero range keeps a unit scale.
///
/// # Arguments
/// * `data` - Input data matrix where each column is a point (`D × N`)
/// * `normalize` - Whether to scale by inverse feature ranges
pub fn initial_transformation(data: ArrayView2<f64>, normalize: bool) -> Array2<f64> {
    let dim = data.nrows();
    if !normalize || data.ncols() == 0 {
        return Array2::eye(dim);
    }

    let scales = data
        .map_axis(Axis(1), |feature| {
            let min = feature.iter().copied().fold(f64::INFINITY, f64::min);
            let max = feature.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            max - min
        })
        .indexed_iter()
        .map(|(d, &range)| {
            if range > 0.0 && range.is_finite() {
                1.0 / range
            } else {
                warn!("Feature {d} has range {range}; using unit scale for it");
                1.0
            }
        })
        .collect::<Vec<_>>();

    Array2::from_diag(&ndarray::Array1::from(scales))
}

/// Seed derived from the current time, used when no seed is configured.
fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Errors that can occur while learning an NCA distance.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NcaError {
    /// Optimizer name is not recognized
    #[error("Unknown optimizer '{0}'; expected 'sgd' or 'lbfgs'")]
    UnknownOptimizer(String),

    /// Number of labels differs from number of points
    #[error("The number of labels ({labels}) must match the number of points ({points})")]
    LabelCountMismatch {
        /// Number of labels supplied
        labels: usize,
        /// Number of points in the dataset
        points: usize,
    },

    /// Input data has 1 or fewer points
    #[error("Sample size must be larger than one")]
    SampleSize,

    /// Labels were expected in the last row, but there is no feature row
    /// besides it
    #[error("Cannot take labels from the last row of a matrix with {rows} row(s)")]
    MissingLabelRow {
        /// Number of rows in the input
        rows: usize,
    },

    /// A label taken from the data is not an integer
    #[error("Label of point {index} is {value}, which is not an integer")]
    InvalidLabel {
        /// Point whose label is invalid
        index: usize,
        /// Offending value
        value: f64,
    },

    /// Matrix does not have the expected number of rows
    #[error("Expected {expected} rows, got {actual}")]
    DimensionMismatch {
        /// Expected number of rows
        expected: usize,
        /// Actual number of rows
        actual: usize,
    },

    /// L-BFGS line search found no step that lowers the objective
    #[error("L-BFGS line search failed to decrease the objective in {trials} trials")]
    LineSearch {
        /// Number of trial steps evaluated
        trials: usize,
    },

    /// PCA decomposition failed
    #[error(transparent)]
    Pca(#[from] DecompositionError),

    /// Reading or writing a file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Text input is malformed
    #[error("Parse error on line {line}: {message}")]
    Parse {
        /// One-based line number, 0 when not tied to a line
        line: usize,
        /// Description of the problem
        message: String,
    },
}
