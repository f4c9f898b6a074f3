//! OpenAI-compatible chat-completions client.
//!
//! One key, one base URL, any council model: the gateway is expected to be
//! an OpenRouter-style multiplexer. Status codes are classified into the
//! three error kinds the runner understands; the per-call deadline is
//! enforced with a request timeout so a slow upstream cannot hold a council
//! seat past its budget.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{ModelClient, ModelError};

const COMPLETION_TEMPERATURE: f64 = 0.2;

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn complete(
        &self,
        model_id: &str,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, ModelError> {
        let body = json!({
            "model": model_id,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": COMPLETION_TEMPERATURE,
        });

        debug!(model_id, deadline_ms = deadline.as_millis() as u64, "Dispatching completion");

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::timeout(format!("{model_id}: deadline elapsed"))
                } else {
                    ModelError::transient(format!("{model_id}: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("{model_id}: HTTP {status}: {detail}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(ModelError::transient(message))
            } else {
                Err(ModelError::permanent(message))
            };
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::transient(format!("{model_id}: malformed body: {e}")))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(ModelError::permanent(format!(
                "{model_id}: gateway returned an empty completion"
            )));
        }

        Ok(text)
    }
}
