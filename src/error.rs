//! Error taxonomy for the inference boundary.
//!
//! Indexing, extraction, configuration and storage code uses `anyhow`
//! like the rest of the crate. Anything that talks to the model server
//! returns [`InferenceError`] instead, because callers branch on the
//! class: network errors get one silent retry, cancellations are not
//! shown as errors at all, and everything else is surfaced with a
//! recovery suggestion.

use thiserror::Error;

/// Failure classes for a completion request or server lifecycle step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// The model server is absent, unreachable, failed to start, or timed out.
    #[error("model error ({model}): {message}")]
    Model { model: String, message: String },

    /// Transient transport failure. Retried once by the session before surfacing.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a structured error. Surfaced verbatim, never retried.
    #[error("server error: {0}")]
    ErrorResponse(String),

    /// The request was interrupted by the user or the system.
    #[error("request cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn model(model: impl Into<String>, message: impl Into<String>) -> Self {
        InferenceError::Model {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Whether the caller should retry automatically (exactly once).
    pub fn is_retryable(&self) -> bool {
        matches!(self, InferenceError::Network(_))
    }

    /// Whether this outcome should be kept out of error UI.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InferenceError::Cancelled)
    }

    /// Short, user-facing description.
    pub fn description(&self) -> String {
        match self {
            InferenceError::Model { model, .. } => {
                format!("The local model '{}' is not available", model)
            }
            InferenceError::Network(_) => "Lost connection to the local model server".to_string(),
            InferenceError::ErrorResponse(msg) => format!("The model server rejected the request: {}", msg),
            InferenceError::Cancelled => "Generation stopped".to_string(),
        }
    }

    /// Longer recovery hint shown next to [`description`](Self::description).
    pub fn recovery_suggestion(&self) -> String {
        match self {
            InferenceError::Model { message, .. } => format!(
                "Check that the model file exists and the server binary is installed, \
                 then try again. If the machine is low on memory, select a smaller model \
                 or reduce the context length. Details: {}",
                message
            ),
            InferenceError::Network(_) => {
                "Retrying automatically. If this keeps happening, restart the model server."
                    .to_string()
            }
            InferenceError::ErrorResponse(_) => {
                "Shorten the conversation or the attached sources and send the message again."
                    .to_string()
            }
            InferenceError::Cancelled => String::new(),
        }
    }
}
