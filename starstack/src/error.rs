//! Error types for starstack

use thiserror::Error;

/// Main error type for registration and stacking operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The normal equations of a least-squares fit could not be solved,
    /// typically because there were too few samples or they were collinear.
    #[error("Singular normal equations: order {order} fit over {samples} samples")]
    SingularMatrix { order: usize, samples: usize },

    #[error("Raster size mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Failure reported by an exposure loader or an output sink.
    #[error("Failed to access {handle}: {reason}")]
    Load { handle: String, reason: String },
}

/// Result type alias for starstack operations
pub type Result<T> = std::result::Result<T, Error>;
