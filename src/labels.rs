//! Label acquisition and remapping.
//!
//! Labels arrive either as the final row of the input matrix or as a separate
//! vector of arbitrary integers. The objective needs dense class ids, so raw
//! labels are mapped to `0..C` in order of first appearance.

use crate::NcaError;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use std::collections::HashMap;

/// Dense class ids together with the raw label each id stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedLabels {
    /// Class id in `0..C` for every point
    pub labels: Array1<usize>,

    /// Raw label of each class id
    pub mapping: Vec<i64>,
}

impl NormalizedLabels {
    /// Number of distinct classes.
    pub fn num_classes(&self) -> usize {
        self.mapping.len()
    }
}

/// Maps arbitrary integer labels to `0..C`, numbering classes in the order
/// they first appear.
pub fn normalize_labels(raw: &[i64]) -> NormalizedLabels {
    let mut ids: HashMap<i64, usize> = HashMap::new();
    let mut mapping = Vec::new();

    let labels = raw
        .iter()
        .map(|&label| {
            *ids.entry(label).or_insert_with(|| {
                mapping.push(label);
                mapping.len() - 1
            })
        })
        .collect();

    NormalizedLabels { labels, mapping }
}

/// Splits the final row off a `(D + 1) × N` matrix and reads it as labels.
///
/// # Returns
/// A tuple containing:
/// * The `D × N` feature matrix
/// * The raw label of every point
///
/// # Errors
/// * `NcaError::MissingLabelRow` - The matrix has fewer than two rows
/// * `NcaError::InvalidLabel` - A label entry is not an integer that fits in
///   an `i64`
#[allow(clippy::cast_precision_loss)]
pub fn labels_from_last_row(data: ArrayView2<f64>) -> Result<(Array2<f64>, Vec<i64>), NcaError> {
    let rows = data.nrows();
    if rows < 2 {
        return Err(NcaError::MissingLabelRow { rows });
    }

    let raw = data
        .index_axis(Axis(0), rows - 1)
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            // i64::MAX rounds up to 2^63 as a float, so that bound is exclusive
            let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
            if in_range && value.fract() == 0.0 {
                Ok(value as i64)
            } else {
                Err(NcaError::InvalidLabel { index, value })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((data.slice(s![..rows - 1, ..]).to_owned(), raw))
}
