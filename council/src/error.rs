//! Error taxonomy for the deliberation pipeline.
//!
//! Two tiers: [`PipelineError`] is fatal and surfaces at the boundary before
//! any stage runs; [`TraceError`] is a recorded degradation that the run
//! survives and carries in its decision trace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified error kinds, as recorded in the decision trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigMissing,
    PromptTooLarge,
    ModelTransient,
    ModelPermanent,
    ModelTimeout,
    ParseFailure,
    ConsensusUndefined,
    StoreFailure,
    ClientDisconnected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigMissing => write!(f, "config_missing"),
            Self::PromptTooLarge => write!(f, "prompt_too_large"),
            Self::ModelTransient => write!(f, "model_transient"),
            Self::ModelPermanent => write!(f, "model_permanent"),
            Self::ModelTimeout => write!(f, "model_timeout"),
            Self::ParseFailure => write!(f, "parse_failure"),
            Self::ConsensusUndefined => write!(f, "consensus_undefined"),
            Self::StoreFailure => write!(f, "store_failure"),
            Self::ClientDisconnected => write!(f, "client_disconnected"),
        }
    }
}

/// A recorded degradation: which stage, which model (if any), what happened.
///
/// These accumulate in `DecisionTrace.errors` and never abort the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceError {
    /// Pipeline phase the error belongs to ("stage1", "stage2", "stage3",
    /// "adjudication", "title", "store").
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl TraceError {
    pub fn new(stage: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            model_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_model(
        stage: &str,
        model_id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            model_id: Some(model_id.to_string()),
            kind,
            message: message.into(),
        }
    }
}

/// Fatal, boundary-only errors. Nothing downstream of these runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    #[error("prompt too large: {actual} bytes exceeds the {limit}-byte limit")]
    PromptTooLarge { actual: usize, limit: usize },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("too many council answers: {0} exceeds the single-letter label alphabet (max 26)")]
    TooManyAnswers(usize),

    #[error("conversation store failure: {0}")]
    Store(String),
}

impl PipelineError {
    /// The trace-level kind this fatal error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigMissing(_) => ErrorKind::ConfigMissing,
            Self::PromptTooLarge { .. } | Self::EmptyPrompt => ErrorKind::PromptTooLarge,
            Self::TooManyAnswers(_) => ErrorKind::ConfigMissing,
            Self::Store(_) => ErrorKind::StoreFailure,
        }
    }
}

/// Result type for boundary operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::ModelTimeout).unwrap();
        assert_eq!(json, "\"model_timeout\"");
        let parsed: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorKind::ModelTimeout);
    }

    #[test]
    fn test_trace_error_model_field_elided() {
        let err = TraceError::new("stage2", ErrorKind::ParseFailure, "bad block");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("model_id"));

        let err = TraceError::for_model("stage1", "m-1", ErrorKind::ModelTransient, "502");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"model_id\":\"m-1\""));
    }

    #[test]
    fn test_prompt_too_large_display() {
        let err = PipelineError::PromptTooLarge {
            actual: 100,
            limit: 50,
        };
        assert!(err.to_string().contains("100 bytes"));
        assert_eq!(err.kind(), ErrorKind::PromptTooLarge);
    }
}
