//! Delimited text matrices.
//!
//! Files hold one point per line, with values separated by commas, tabs or
//! spaces. In memory the layout is transposed so that points are columns.

use crate::NcaError;
use ndarray::{Array2, ArrayView2};
use std::fs;
use std::path::Path;

/// Splits a line into its non-empty cells.
fn cells(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|cell| !cell.is_empty())
}

/// Parses delimited text with one point per line into a `D × N` matrix.
///
/// Blank lines are skipped.
///
/// # Errors
/// * `NcaError::Parse` - A cell is not a number or lines differ in length
pub fn parse_matrix(text: &str) -> Result<Array2<f64>, NcaError> {
    let mut values = Vec::new();
    let mut dimensions: Option<usize> = None;
    let mut points = 0;

    for (index, line) in text.lines().enumerate() {
        let before = values.len();
        for cell in cells(line) {
            let value = cell.parse::<f64>().map_err(|err| NcaError::Parse {
                line: index + 1,
                message: format!("'{cell}' is not a number: {err}"),
            })?;
            values.push(value);
        }

        let width = values.len() - before;
        if width == 0 {
            continue;
        }

        match dimensions {
            None => dimensions = Some(width),
            Some(expected) if expected != width => {
                return Err(NcaError::Parse {
                    line: index + 1,
                    message: format!("expected {expected} values, found {width}"),
                });
            }
            Some(_) => {}
        }
        points += 1;
    }

    let dimensions = dimensions.unwrap_or(0);
    let by_point = Array2::from_shape_vec((points, dimensions), values).map_err(|err| {
        NcaError::Parse {
            line: 0,
            message: err.to_string(),
        }
    })?;

    Ok(by_point.reversed_axes().as_standard_layout().into_owned())
}

/// Reads a matrix file; see [`parse_matrix`] for the format.
///
/// # Errors
/// * `NcaError::Io` - The file cannot be read
/// * `NcaError::Parse` - The contents are malformed
pub fn read_matrix(path: impl AsRef<Path>) -> Result<Array2<f64>, NcaError> {
    parse_matrix(&fs::read_to_string(path)?)
}

/// Parses integer labels separated by any mix of commas and whitespace.
///
/// # Errors
/// * `NcaError::Parse` - A cell is not an integer
pub fn parse_labels(text: &str) -> Result<Vec<i64>, NcaError> {
    text.lines()
        .enumerate()
        .flat_map(|(index, line)| cells(line).map(move |cell| (index, cell)))
        .map(|(index, cell)| {
            cell.parse::<i64>().map_err(|err| NcaError::Parse {
                line: index + 1,
                message: format!("'{cell}' is not an integer label: {err}"),
            })
        })
        .collect()
}

/// Reads a label file; see [`parse_labels`] for the format.
///
/// # Errors
/// * `NcaError::Io` - The file cannot be read
/// * `NcaError::Parse` - The contents are malformed
pub fn read_labels(path: impl AsRef<Path>) -> Result<Vec<i64>, NcaError> {
    parse_labels(&fs::read_to_string(path)?)
}

/// Formats a matrix as comma-separated rows.
pub fn format_matrix(matrix: ArrayView2<f64>) -> String {
    matrix
        .rows()
        .into_iter()
        .map(|row| {
            let mut line = row.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            line.push('\n');
            line
        })
        .collect()
}

/// Writes a matrix as comma-separated rows.
///
/// # Errors
/// * `NcaError::Io` - The file cannot be written
pub fn write_matrix(path: impl AsRef<Path>, matrix: ArrayView2<f64>) -> Result<(), NcaError> {
    fs::write(path, format_matrix(matrix))?;
    Ok(())
}
