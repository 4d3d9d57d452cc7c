// THEORY:
// Every stage of the engine fails the same way: the whole invocation is rejected
// and nothing partial is handed back. A single error enum keeps that contract
// visible at the API surface. Degenerate neighborhoods (zero variance, zero
// weight sum) are deliberately absent here: they are handled numerically by the
// affinity stage and never surface as errors.

use thiserror::Error;

/// Errors produced while expanding seeds into dense class masks.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagationError {
    /// The neighborhood window must be odd and at least 3 pixels wide.
    #[error("invalid window size {size}: must be odd and >= 3")]
    InvalidWindowSize { size: usize },

    /// Two inputs that must share a shape do not.
    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },

    /// No seed channels were supplied, so there is nothing to propagate.
    #[error("at least one seed mask is required")]
    EmptySeeds,

    /// The constraint matrix could not be factorized. This points at an
    /// assembly defect and is never retried.
    #[error("constraint system is singular: {reason}")]
    SingularSystem { reason: String },

    /// A background task of the parallel pipeline panicked or was cancelled.
    #[error("parallel worker failed: {reason}")]
    WorkerFailed { reason: String },
}

impl PropagationError {
    pub(crate) fn shape_mismatch(
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Self {
        Self::DimensionMismatch {
            what,
            expected: format!("{}x{}", expected.0, expected.1),
            found: format!("{}x{}", found.0, found.1),
        }
    }

    pub(crate) fn count_mismatch(what: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PropagationError>;
