/// Error type for the dense Hebbian layer.
///
/// Shape problems are programming errors in the caller, but they are reported
/// as values at construction or first use rather than as panics deep inside a
/// sweep. Internal tape invariants still use `assert!`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HebbError {
    #[error("layer dimensions must be positive (inputs={input_count}, outputs={output_count})")]
    ZeroDimension { input_count: usize, output_count: usize },

    #[error("trace rate has {len} values; expected 1 or {per_connection}")]
    TraceRateLength { len: usize, per_connection: usize },

    #[error("{what} has {got} values; expected {expected}")]
    ShapeMismatch { what: String, expected: usize, got: usize },

    #[error("input has {got} values; cell expects {expected}")]
    InputSize { expected: usize, got: usize },

    #[error("no batch member {member} (batch has {count})")]
    UnknownMember { member: usize, count: usize },

    #[error("member {member} appears more than once in a single timestep")]
    DuplicateMember { member: usize },

    #[error("member {member} has no step {step} (length {len})")]
    UnknownStep { member: usize, step: usize, len: usize },

    #[error("direction does not match the cell's parameters: {0}")]
    DirectionMismatch(String),

    #[error("graph was built without a parameter direction")]
    NoSensitivity,

    #[error("{tensor}[{index}] is {value}; checkpoints hold finite values only")]
    NonFinite { tensor: &'static str, index: usize, value: f64 },

    #[error("a cell stack needs at least one layer")]
    EmptyStack,

    #[error("trace rate range ({min}, {max}) must satisfy 0 < min <= max < 1")]
    RateRange { min: f64, max: f64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HebbError {
    pub(crate) fn shape(what: impl Into<String>, expected: usize, got: usize) -> Self {
        HebbError::ShapeMismatch { what: what.into(), expected, got }
    }
}

/// Fail with `ShapeMismatch` unless `got == expected`.
pub(crate) fn expect_len(what: &str, expected: usize, got: usize) -> Result<(), HebbError> {
    if expected == got {
        Ok(())
    } else {
        Err(HebbError::shape(what, expected, got))
    }
}
