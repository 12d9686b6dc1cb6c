use thiserror::Error;

/// Errors raised by the tensor memory hierarchy and the training pipeline.
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("tensor {0} has already been released")]
    Released(u64),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot multiply {left:?} by {right:?}")]
    IncompatibleOperands { left: Vec<usize>, right: Vec<usize> },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("numeric instability: {0}")]
    Numeric(String),

    #[error("corrupt tensor file: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("epoch aborted after {failed} failed batches (limit {limit})")]
    TooManyFailures { failed: usize, limit: usize },
}

impl From<serde_json::Error> for TensorError {
    fn from(error: serde_json::Error) -> Self {
        TensorError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for TensorError {
    fn from(error: bincode::Error) -> Self {
        TensorError::Serialization(error.to_string())
    }
}

impl TensorError {
    /// True for errors that mean the requested item does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            TensorError::NotFound(_) => true,
            TensorError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;
