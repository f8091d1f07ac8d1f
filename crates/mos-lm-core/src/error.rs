//! Error types for model construction and forward computation.

use thiserror::Error;

/// Model-specific errors.
///
/// Construction errors (`InvalidConfig`, `UnknownWeight`, `TieDimMismatch`)
/// are surfaced before any parameter is allocated; forward-call errors
/// (`ShapeMismatch`, `Tensor`) abort the call with no partial state change.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid construction arguments.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Weight-drop target parameter does not exist on the wrapped cell.
    #[error("no weight parameter named '{name}' on the wrapped cell")]
    UnknownWeight { name: String },

    /// Weight tying requested with incompatible dimensions.
    #[error(
        "weight tying requires the embedding width ({embedding}) to equal \
         the per-expert latent width ({latent})"
    )]
    TieDimMismatch { embedding: usize, latent: usize },

    /// Forward-call input dimensions inconsistent with configured sizes.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// Failure in the underlying tensor substrate.
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;
