//! Error type shared by every layer.
//!
//! Shape and lifecycle violations are reported as values instead of panics so
//! the training loop that owns the layers decides what to do with them. None
//! of these are recoverable by retrying: a gradient computed against the wrong
//! cache is simply wrong.

use thiserror::Error;

/// Errors produced by layer operations.
#[derive(Error, Debug)]
pub enum LayerError {
    /// A tensor's shape violates the operation's precondition.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Parameters or a forward cache were used before they existed.
    #[error("{layer}: {reason}")]
    Uninitialized {
        layer: &'static str,
        reason: &'static str,
    },

    /// The layer cannot handle this kind of input.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Hyperparameters that can never produce a valid layer.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be (de)serialized.
    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;

impl LayerError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        LayerError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub(crate) fn no_forward(layer: &'static str) -> Self {
        LayerError::Uninitialized {
            layer,
            reason: "backward called without a matching forward",
        }
    }

    pub(crate) fn no_params(layer: &'static str) -> Self {
        LayerError::Uninitialized {
            layer,
            reason: "parameters accessed before initialization",
        }
    }
}

/// Fail unless `got == expected`.
pub(crate) fn ensure_shape(context: &'static str, expected: &[usize], got: &[usize]) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(LayerError::shape(context, expected, got))
    }
}
