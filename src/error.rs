//! Error types shared by the diffusion core.
//!
//! Every failure in this crate is a programming or configuration error, not a
//! transient fault: nothing is retried, errors propagate immediately.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffusionError {
    /// The model was constructed with inconsistent hyperparameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A call-time input the configured variant cannot handle.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
}

impl DiffusionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedInput(msg.into())
    }
}

pub type Result<T, E = DiffusionError> = core::result::Result<T, E>;
