//! Fan-out executor for one stage's model calls.
//!
//! Tasks dispatch concurrently, each with its own deadline and bounded
//! retry; results come back in input order no matter how completion
//! interleaves. `run_all` never fails as a whole — partial success is the
//! normal outcome, and each slot carries its own text or classified error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ModelClient, ModelError};
use crate::config::RetryPolicy;

/// One model call: who to ask and with what.
#[derive(Debug, Clone)]
pub struct ModelTask {
    pub model_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// The slot for one task after `run_all` returns.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub model_id: String,
    pub outcome: Result<String, ModelError>,
    pub latency_ms: u64,
    pub attempts: u32,
}

impl TaskResult {
    pub fn error(&self) -> Option<&ModelError> {
        self.outcome.as_ref().err()
    }
}

/// Fan-out runner bound to one gateway client and one retry policy.
#[derive(Clone)]
pub struct StageRunner {
    client: Arc<dyn ModelClient>,
    retry: RetryPolicy,
}

impl StageRunner {
    pub fn new(client: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Run every task concurrently. Only transient and timeout errors are
    /// retried; a tripped cancellation token stops dispatch and marks the
    /// remaining slots `Canceled`.
    pub async fn run_all(
        &self,
        tasks: Vec<ModelTask>,
        per_task_deadline: Duration,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        join_all(
            tasks
                .into_iter()
                .map(|task| self.run_one(task, per_task_deadline, cancel)),
        )
        .await
    }

    async fn run_one(
        &self,
        task: ModelTask,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last_error = ModelError::canceled();

        while attempts < self.retry.max_attempts {
            if cancel.is_cancelled() {
                return self.finish(&task, Err(ModelError::canceled()), started, attempts);
            }
            attempts += 1;

            let call = self.client.complete(
                &task.model_id,
                &task.system_prompt,
                &task.user_prompt,
                deadline,
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.finish(&task, Err(ModelError::canceled()), started, attempts);
                }
                result = tokio::time::timeout(deadline, call) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ModelError::timeout(format!(
                        "{}: no response within {:?}",
                        task.model_id, deadline
                    ))),
                },
            };

            match result {
                Ok(text) => {
                    debug!(model_id = %task.model_id, attempts, "Task completed");
                    return self.finish(&task, Ok(text), started, attempts);
                }
                Err(error) => {
                    if !error.kind.is_retryable() || attempts >= self.retry.max_attempts {
                        return self.finish(&task, Err(error), started, attempts);
                    }
                    let delay = self.backoff_delay(attempts);
                    warn!(
                        model_id = %task.model_id,
                        attempt = attempts,
                        max = self.retry.max_attempts,
                        kind = %error.kind,
                        "Task failed, retrying in {:?}",
                        delay
                    );
                    last_error = error;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.finish(&task, Err(ModelError::canceled()), started, attempts);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.finish(&task, Err(last_error), started, attempts)
    }

    fn finish(
        &self,
        task: &ModelTask,
        outcome: Result<String, ModelError>,
        started: Instant,
        attempts: u32,
    ) -> TaskResult {
        TaskResult {
            model_id: task.model_id.clone(),
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
        }
    }

    /// Exponential backoff with full jitter:
    /// uniform over `[0, min(cap, base * 2^(attempt-1))]`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let ceiling = exp.min(self.retry.backoff_cap);
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ModelErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client whose behaviour is scripted per call via a closure.
    struct FnClient<F>(F);

    #[async_trait]
    impl<F> ModelClient for FnClient<F>
    where
        F: Fn(&str) -> Result<String, ModelError> + Send + Sync,
    {
        async fn complete(
            &self,
            model_id: &str,
            _system_prompt: &str,
            _user_prompt: &str,
            _deadline: Duration,
        ) -> Result<String, ModelError> {
            (self.0)(model_id)
        }
    }

    /// Client that never returns until cancelled or timed out.
    struct HangingClient;

    #[async_trait]
    impl ModelClient for HangingClient {
        async fn complete(
            &self,
            _model_id: &str,
            _system_prompt: &str,
            _user_prompt: &str,
            _deadline: Duration,
        ) -> Result<String, ModelError> {
            std::future::pending().await
        }
    }

    fn task(model: &str) -> ModelTask {
        ModelTask {
            model_id: model.to_string(),
            system_prompt: "sys".to_string(),
            user_prompt: "user".to_string(),
        }
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let client = Arc::new(FnClient(|model: &str| Ok(format!("answer from {model}"))));
        let runner = StageRunner::new(client, retry(1));
        let tasks = vec![task("m1"), task("m2"), task("m3")];

        let results = runner
            .run_all(tasks, Duration::from_secs(1), &CancellationToken::new())
            .await;

        let ids: Vec<&str> = results.iter().map(|r| r.model_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(results[1].outcome.as_deref().unwrap(), "answer from m2");
    }

    #[tokio::test]
    async fn test_partial_success_is_normal() {
        let client = Arc::new(FnClient(|model: &str| {
            if model == "bad" {
                Err(ModelError::permanent("401 bad key"))
            } else {
                Ok("fine".to_string())
            }
        }));
        let runner = StageRunner::new(client, retry(3));

        let results = runner
            .run_all(
                vec![task("good"), task("bad")],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert!(results[0].outcome.is_ok());
        let error = results[1].error().unwrap();
        assert_eq!(error.kind, ModelErrorKind::Permanent);
        // Permanent errors burn exactly one attempt.
        assert_eq!(results[1].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let client = Arc::new(FnClient(move |_: &str| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ModelError::transient("502"))
            } else {
                Ok("recovered".to_string())
            }
        }));
        let runner = StageRunner::new(client, retry(3));

        let results = runner
            .run_all(
                vec![task("m")],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].outcome.as_deref().unwrap(), "recovered");
        assert_eq!(results[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_to_last_error() {
        let client = Arc::new(FnClient(|_: &str| {
            Err::<String, _>(ModelError::transient("always down"))
        }));
        let runner = StageRunner::new(client, retry(3));

        let results = runner
            .run_all(
                vec![task("m")],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        let error = results[0].error().unwrap();
        assert_eq!(error.kind, ModelErrorKind::Transient);
        assert_eq!(results[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_becomes_timeout() {
        let runner = StageRunner::new(Arc::new(HangingClient), retry(1));

        let results = runner
            .run_all(
                vec![task("slow")],
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].error().unwrap().kind, ModelErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_one_slot_leaves_others_alone() {
        let client = Arc::new(FnClient(|model: &str| {
            if model == "ok" {
                Ok("done".to_string())
            } else {
                Err(ModelError::timeout("deadline"))
            }
        }));
        let runner = StageRunner::new(client, retry(1));

        let results = runner
            .run_all(
                vec![task("ok"), task("late")],
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert!(results[0].outcome.is_ok());
        assert_eq!(results[1].error().unwrap().kind, ModelErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_marks_slots_canceled() {
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(Arc::new(HangingClient), retry(3));

        let run = runner.run_all(
            vec![task("m1"), task("m2")],
            Duration::from_secs(60),
            &cancel,
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };

        let (results, ()) = tokio::join!(run, canceller);
        for result in &results {
            assert_eq!(result.error().unwrap().kind, ModelErrorKind::Canceled);
        }
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = StageRunner::new(Arc::new(HangingClient), retry(3));

        let results = runner
            .run_all(vec![task("m")], Duration::from_secs(60), &cancel)
            .await;

        assert_eq!(results[0].error().unwrap().kind, ModelErrorKind::Canceled);
        assert_eq!(results[0].attempts, 0);
    }

    #[test]
    fn test_backoff_stays_within_cap() {
        let runner = StageRunner::new(
            Arc::new(HangingClient),
            RetryPolicy {
                max_attempts: 10,
                backoff_base: Duration::from_millis(100),
                backoff_cap: Duration::from_millis(400),
            },
        );

        for attempt in 1..10 {
            let delay = runner.backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(400));
        }
    }
}
