//! Optimizer abstraction and strategy selection.

use crate::function::DecomposableFunction;
use crate::NcaError;
use ndarray::Array2;
use std::fmt;
use std::str::FromStr;

/// A minimizer of a [`DecomposableFunction`].
///
/// Strategies see the objective only through the trait, so any of them can
/// drive any objective. The coordinates are updated in place; the returned
/// value is the objective at the final coordinates.
pub trait Optimizer {
    /// Minimizes `function` starting from `coordinates`.
    ///
    /// # Errors
    /// Strategy specific; see the implementing type.
    fn optimize(
        &mut self,
        function: &dyn DecomposableFunction,
        coordinates: &mut Array2<f64>,
    ) -> Result<f64, NcaError>;
}

/// The optimization strategies available to [`crate::learn_distance`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum OptimizerKind {
    /// Mini-batch stochastic gradient descent
    #[default]
    Sgd,

    /// Limited-memory BFGS with a backtracking line search
    Lbfgs,
}

impl FromStr for OptimizerKind {
    type Err = NcaError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sgd" => Ok(Self::Sgd),
            "lbfgs" => Ok(Self::Lbfgs),
            other => Err(NcaError::UnknownOptimizer(other.to_owned())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => f.write_str("sgd"),
            Self::Lbfgs => f.write_str("lbfgs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optimizer_kind() {
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("lbfgs".parse::<OptimizerKind>().unwrap(), OptimizerKind::Lbfgs);
        assert_eq!(OptimizerKind::Lbfgs.to_string(), "lbfgs");
    }

    #[test]
    fn test_unknown_optimizer() {
        let err = "adam".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, NcaError::UnknownOptimizer(ref name) if name == "adam"));
        assert_eq!(err.to_string(), "Unknown optimizer 'adam'; expected 'sgd' or 'lbfgs'");
    }
}
