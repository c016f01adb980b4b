//! Error types emitted by the attention operator.

use arena_runtime::RuntimeError;
use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The options buffer is missing or cannot be decoded. Fatal at build time.
    #[error("invalid operator configuration: {reason}")]
    Config { reason: String },

    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {tensor}: {context}")]
    InvalidShape {
        tensor: &'static str,
        context: String,
    },

    /// A configuration value is outside its valid range.
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument { arg: &'static str, reason: String },

    /// The scratch buffer handed to the kernel is smaller than its layout.
    #[error("scratch buffer holds {available} floats, layout needs {required}")]
    ScratchTooSmall { required: usize, available: usize },

    /// Invoke ran without a successful prepare.
    #[error("operator state has no scratch reservation; prepare did not run")]
    MissingState,

    /// A failure reported by the host runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A failure inside the Candle reference path.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(tensor: &'static str, context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            tensor,
            context: context.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        AttentionError::Config {
            reason: reason.into(),
        }
    }
}
