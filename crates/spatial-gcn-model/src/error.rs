//! Error type for the grid GCN model.

use thiserror::Error;

/// Errors raised by graph construction, layers, and the training step.
///
/// Backend failures (shape errors inside a matmul, device allocation,
/// NaN-producing kernels) are wrapped as-is in [`GcnError::Candle`].
#[derive(Debug, Error)]
pub enum GcnError {
    /// The node axis of an input cannot be mapped onto the expected grid.
    #[error("invalid grid shape: {0}")]
    InvalidGridShape(String),

    /// A requested output column does not exist.
    #[error("output index {index} out of range for {out_features} output features")]
    IndexOutOfRange { index: usize, out_features: usize },

    /// An output column subset was requested but contained no indices.
    #[error("output index subset is empty")]
    EmptyIndices,

    /// Input feature dimension does not match the layer's `in_features`.
    #[error("feature dimension mismatch: expected {expected}, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown or unavailable compute device.
    #[error("device error: {0}")]
    Device(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GcnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GcnError::IndexOutOfRange {
            index: 5,
            out_features: 4,
        };
        assert_eq!(
            err.to_string(),
            "output index 5 out of range for 4 output features"
        );

        let err = GcnError::InvalidGridShape("10 nodes is not a square".into());
        assert!(err.to_string().starts_with("invalid grid shape"));
    }

    #[test]
    fn test_candle_error_converts() {
        let candle_err = candle_core::Error::Msg("boom".into());
        let err: GcnError = candle_err.into();
        assert!(matches!(err, GcnError::Candle(_)));
    }
}
