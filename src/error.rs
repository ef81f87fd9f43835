//! Error taxonomy for the saliency pipeline.
//!
//! Two failure classes exist, both raised before any tensor work begins:
//! construction-time configuration conflicts and call-time shape mismatches.
//! Everything past validation is total — a forward pass either completes or
//! never starts.

use thiserror::Error;

/// Library-wide error type.
#[derive(Debug, Error)]
pub enum SalError {
    /// Mutually exclusive or out-of-range configuration options, detected at
    /// construction time.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Input tensor rank or dimension mismatch, detected at call time.
    #[error("shape mismatch: expected {expected}, got {got}")]
    Shape { expected: String, got: String },
}

impl SalError {
    pub fn config(reason: impl Into<String>) -> Self {
        SalError::Config {
            reason: reason.into(),
        }
    }

    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        SalError::Shape {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = SalError::shape("rank 4 or 5", "rank 3");
        let msg = err.to_string();
        assert!(msg.contains("rank 4 or 5"));
        assert!(msg.contains("rank 3"));
    }

    #[test]
    fn test_config_reason() {
        let err = SalError::config("dropout_rate must lie in [0, 1)");
        assert!(err.to_string().contains("dropout_rate"));
    }
}
