//! Environment-sourced configuration.
//!
//! Everything is read once at startup and injected into the orchestrator;
//! nothing here is consulted again mid-run. A missing `MODEL_API_KEY` is the
//! one fatal condition — every other variable has a default.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::roles::Role;

/// Default council, in seat order. Overridable via `COUNCIL_MODELS`.
const DEFAULT_COUNCIL: [&str; 4] = [
    "openai/gpt-5.2",
    "google/gemini-3-pro-preview",
    "anthropic/claude-sonnet-4.5",
    "x-ai/grok-4.1-fast",
];

const DEFAULT_CHAIRMAN: &str = "anthropic/claude-opus-4.5";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// One council seat: a model and the generation role it answers under.
#[derive(Debug, Clone)]
pub struct CouncilMember {
    pub model_id: String,
    pub role: Role,
}

/// Bounded-retry policy for the fan-out runner. Only transient and timeout
/// errors are retried; backoff is `min(cap, base * 2^(attempt-1))` with full
/// jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

/// Per-stage task deadlines. Title generation gets its own small deadline
/// and its failure is swallowed.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub stage1: Duration,
    pub stage2: Duration,
    pub stage3: Duration,
    pub title: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            stage1: Duration::from_secs(120),
            stage2: Duration::from_secs(120),
            stage3: Duration::from_secs(180),
            title: Duration::from_secs(20),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct CouncilConfig {
    pub members: Vec<CouncilMember>,
    pub chairman_model_id: String,
    pub adjudicator_model_id: Option<String>,
    pub api_key: String,
    pub base_url: String,
    pub timeouts: StageTimeouts,
    pub retry: RetryPolicy,
    pub max_prompt_bytes: usize,
    pub persist_storage: bool,
    pub conversations_file: PathBuf,
    pub cors_allow_origins: Vec<String>,
}

impl CouncilConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> PipelineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup. `from_env` is this
    /// with `std::env::var`; tests inject closures instead of mutating
    /// process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PipelineResult<Self> {
        let api_key = lookup("MODEL_API_KEY")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                PipelineError::ConfigMissing(
                    "MODEL_API_KEY is not set; the pipeline cannot reach the model gateway"
                        .to_string(),
                )
            })?;

        let members = csv(&lookup, "COUNCIL_MODELS")
            .unwrap_or_else(|| DEFAULT_COUNCIL.iter().map(|m| m.to_string()).collect())
            .into_iter()
            .enumerate()
            .map(|(i, model_id)| CouncilMember {
                model_id,
                role: Role::for_seat(i),
            })
            .collect::<Vec<_>>();

        if members.is_empty() {
            return Err(PipelineError::ConfigMissing(
                "COUNCIL_MODELS resolved to an empty council".to_string(),
            ));
        }

        Ok(Self {
            members,
            chairman_model_id: lookup("CHAIRMAN_MODEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CHAIRMAN.to_string()),
            adjudicator_model_id: lookup("ADJUDICATOR_MODEL").filter(|v| !v.trim().is_empty()),
            api_key,
            base_url: lookup("MODEL_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeouts: StageTimeouts {
                stage1: secs(&lookup, "STAGE1_TIMEOUT_SECS", 120),
                stage2: secs(&lookup, "STAGE2_TIMEOUT_SECS", 120),
                stage3: secs(&lookup, "STAGE3_TIMEOUT_SECS", 180),
                title: secs(&lookup, "TITLE_TIMEOUT_SECS", 20),
            },
            retry: RetryPolicy {
                max_attempts: parse(&lookup, "RETRY_MAX_ATTEMPTS", 3).max(1),
                backoff_base: Duration::from_millis(parse(&lookup, "RETRY_BACKOFF_BASE_MS", 500)),
                backoff_cap: Duration::from_millis(parse(&lookup, "RETRY_BACKOFF_CAP_MS", 8_000)),
            },
            max_prompt_bytes: parse(&lookup, "MAX_PROMPT_BYTES", 65_536),
            persist_storage: lookup("PERSIST_STORAGE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            conversations_file: lookup("CONVERSATIONS_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/conversations.json")),
            cors_allow_origins: csv(&lookup, "CORS_ALLOW_ORIGINS")
                .unwrap_or_else(|| vec!["*".to_string()]),
        })
    }

    /// Validate a user prompt against the byte limit before any stage runs.
    pub fn check_prompt(&self, prompt: &str) -> PipelineResult<()> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }
        if prompt.len() > self.max_prompt_bytes {
            return Err(PipelineError::PromptTooLarge {
                actual: prompt.len(),
                limit: self.max_prompt_bytes,
            });
        }
        Ok(())
    }

    /// Role name of a configured model, covering council seats and the
    /// reserved chairman/adjudicator roles.
    pub fn role_of(&self, model_id: &str) -> Option<Role> {
        if model_id == self.chairman_model_id {
            return Some(Role::Chairman);
        }
        if self.adjudicator_model_id.as_deref() == Some(model_id) {
            return Some(Role::Adjudicator);
        }
        self.members
            .iter()
            .find(|m| m.model_id == model_id)
            .map(|m| m.role)
    }
}

fn csv(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<String>> {
    lookup(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(parse(lookup, key, default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let err = CouncilConfig::from_lookup(env(&[])).unwrap_err();
        assert!(err.to_string().contains("MODEL_API_KEY"));
    }

    #[test]
    fn test_defaults() {
        let config = CouncilConfig::from_lookup(env(&[("MODEL_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.members.len(), 4);
        assert_eq!(config.members[0].role, Role::Builder);
        assert_eq!(config.members[3].role, Role::Auditor);
        assert_eq!(config.chairman_model_id, DEFAULT_CHAIRMAN);
        assert!(config.adjudicator_model_id.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_prompt_bytes, 65_536);
        assert!(!config.persist_storage);
    }

    #[test]
    fn test_council_models_override_and_role_rotation() {
        let config = CouncilConfig::from_lookup(env(&[
            ("MODEL_API_KEY", "k"),
            ("COUNCIL_MODELS", "m1, m2,m3,m4,m5"),
            ("ADJUDICATOR_MODEL", "ref-model"),
        ]))
        .unwrap();
        assert_eq!(config.members.len(), 5);
        assert_eq!(config.members[4].model_id, "m5");
        assert_eq!(config.members[4].role, Role::Builder);
        assert_eq!(config.adjudicator_model_id.as_deref(), Some("ref-model"));
    }

    #[test]
    fn test_empty_council_rejected() {
        let result = CouncilConfig::from_lookup(env(&[
            ("MODEL_API_KEY", "k"),
            ("COUNCIL_MODELS", " , "),
        ]));
        // A blank list falls back to the default council rather than failing.
        assert_eq!(result.unwrap().members.len(), 4);
    }

    #[test]
    fn test_timeouts_and_retry_from_env() {
        let config = CouncilConfig::from_lookup(env(&[
            ("MODEL_API_KEY", "k"),
            ("STAGE2_TIMEOUT_SECS", "45"),
            ("RETRY_MAX_ATTEMPTS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.timeouts.stage2, Duration::from_secs(45));
        // max_attempts is clamped to at least one attempt.
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_check_prompt() {
        let mut config = CouncilConfig::from_lookup(env(&[("MODEL_API_KEY", "k")])).unwrap();
        config.max_prompt_bytes = 8;
        assert!(config.check_prompt("short").is_ok());
        assert!(matches!(
            config.check_prompt("much too long for the limit"),
            Err(PipelineError::PromptTooLarge { .. })
        ));
        assert!(config.check_prompt("   ").is_err());
    }

    #[test]
    fn test_role_of() {
        let config = CouncilConfig::from_lookup(env(&[("MODEL_API_KEY", "k")])).unwrap();
        assert_eq!(config.role_of(DEFAULT_CHAIRMAN), Some(Role::Chairman));
        assert_eq!(config.role_of(DEFAULT_COUNCIL[1]), Some(Role::Skeptic));
        assert_eq!(config.role_of("unknown"), None);
    }
}
