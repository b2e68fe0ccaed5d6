//! Errors raised when a retrieval is configured or called incorrectly.

use thiserror::Error;

/// Failure to set up or start a retrieval.
///
/// All variants describe configuration or precondition problems that are
/// detected before any iteration begins. Numerical trouble during iteration
/// never produces an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("Invalid axis {index}: {reason}")]
    InvalidAxis { index: usize, reason: String },

    #[error("Lookup table shape {lut_shape:?} does not match axes: {reason}")]
    ShapeMismatch {
        lut_shape: Vec<usize>,
        reason: String,
    },

    #[error("State index {state_index} must lie in 1..{n_axes}, leaving at least one parameter axis")]
    InvalidStateIndex { state_index: usize, n_axes: usize },

    #[error("Unknown increment form {0:?}")]
    UnknownIncrementForm(String),

    #[error("Dimension mismatch for {quantity}: expected {expected}, got {actual}")]
    DimensionMismatch {
        quantity: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Could not build worker pool: {0}")]
    ThreadPool(String),
}

impl RetrievalError {
    pub(crate) fn vector_length(quantity: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            quantity,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn matrix_shape(
        quantity: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    ) -> Self {
        Self::DimensionMismatch {
            quantity,
            expected: format!("{}x{}", expected.0, expected.1),
            actual: format!("{}x{}", actual.0, actual.1),
        }
    }
}
