//! Model gateway abstraction.
//!
//! One trait, one operation: issue a prompt to a named model and get text or
//! a classified error back. The client honours the caller's deadline and
//! never retries internally — retry lives in the stage runner.

mod openrouter;

pub use openrouter::OpenRouterClient;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Classification of a failed model call. Drives retry and trace recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// Network hiccup, HTTP 429/502/503 — worth retrying.
    Transient,
    /// Other 4xx, bad credentials, content policy — retrying cannot help.
    Permanent,
    /// The per-task deadline elapsed.
    Timeout,
    /// The run's cancellation token tripped before completion.
    Canceled,
}

impl ModelErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Timeout => write!(f, "timeout"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<ModelErrorKind> for ErrorKind {
    fn from(kind: ModelErrorKind) -> Self {
        match kind {
            ModelErrorKind::Transient => ErrorKind::ModelTransient,
            ModelErrorKind::Permanent => ErrorKind::ModelPermanent,
            ModelErrorKind::Timeout => ErrorKind::ModelTimeout,
            ModelErrorKind::Canceled => ErrorKind::ClientDisconnected,
        }
    }
}

/// A failed model call.
#[derive(Debug, Clone, Error)]
#[error("{kind} error from model gateway: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: ModelErrorKind::Canceled,
            message: "run canceled before the call completed".to_string(),
        }
    }
}

/// The upstream model gateway.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Issue one prompt to one model. Must return within `deadline`; must
    /// not retry.
    async fn complete(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ModelErrorKind::Transient.is_retryable());
        assert!(ModelErrorKind::Timeout.is_retryable());
        assert!(!ModelErrorKind::Permanent.is_retryable());
        assert!(!ModelErrorKind::Canceled.is_retryable());
    }

    #[test]
    fn test_kind_maps_into_trace_kind() {
        assert_eq!(
            ErrorKind::from(ModelErrorKind::Timeout),
            ErrorKind::ModelTimeout
        );
        assert_eq!(
            ErrorKind::from(ModelErrorKind::Canceled),
            ErrorKind::ClientDisconnected
        );
    }

    #[test]
    fn test_error_display() {
        let err = ModelError::transient("HTTP 502 from gateway");
        assert_eq!(
            err.to_string(),
            "transient error from model gateway: HTTP 502 from gateway"
        );
    }
}
