//! The three-stage orchestrator.
//!
//! Sequences generation → judging → (optional adjudication) → synthesis for
//! one user message, owns the decision trace, and emits lifecycle events as
//! each stage settles. Only prompt validation is fatal; every downstream
//! failure degrades the output and is recorded in the trace. The trace is
//! committed to the conversation store even when the client has gone away.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adjudication::AdjudicationPolicy;
use crate::anonymize::{LabelMap, PublicAnswer};
use crate::client::{ModelClient, ModelErrorKind};
use crate::config::CouncilConfig;
use crate::consensus::{ConsensusMetrics, ConsensusScorer};
use crate::error::{ErrorKind, PipelineError, PipelineResult, TraceError};
use crate::events::{CouncilEvent, EventStream};
use crate::prompts;
use crate::ranking::{extract_label_chain, RankingParser};
use crate::roles::Role;
use crate::runner::{ModelTask, StageRunner, TaskResult};
use crate::storage::{ConversationStore, StoredMessage, UserMessage, DEFAULT_TITLE};
use crate::types::{
    AdjudicationRecord, AssistantMessage, Contributor, DecisionTrace, Judgement, Label,
    PartialReason, Rejection, Stage1Answer, Stage3Result,
};

const STAGE1_ALL_FAILED: &str = "All models failed to respond in Stage 1";

/// Mutable per-run bookkeeping. Everything here ends up in the trace.
#[derive(Default)]
struct RunState {
    errors: Vec<TraceError>,
    disconnected: bool,
}

impl RunState {
    fn record(&mut self, error: TraceError) {
        self.errors.push(error);
    }
}

pub struct Orchestrator {
    config: CouncilConfig,
    runner: StageRunner,
    store: Arc<dyn ConversationStore>,
    policy: AdjudicationPolicy,
}

impl Orchestrator {
    pub fn new(
        config: CouncilConfig,
        client: Arc<dyn ModelClient>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let runner = StageRunner::new(client, config.retry.clone());
        Self {
            config,
            runner,
            store,
            policy: AdjudicationPolicy::default(),
        }
    }

    /// Run the full pipeline for one user message and hand the assistant
    /// message to the conversation store.
    pub async fn run(
        &self,
        conversation_id: &str,
        prompt: &str,
        sink: &EventStream,
    ) -> PipelineResult<AssistantMessage> {
        let run_id = Uuid::new_v4();
        info!(%run_id, conversation_id, "Council run started");

        // Fatal boundary checks: nothing streams, nothing persists.
        if let Err(fatal) = self.config.check_prompt(prompt) {
            let _ = sink.emit(CouncilEvent::Error {
                message: fatal.to_string(),
            });
            return Err(fatal);
        }

        self.store
            .load(conversation_id)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        self.store
            .append_message(
                conversation_id,
                StoredMessage::User(UserMessage::new(prompt)),
            )
            .map_err(|e| PipelineError::Store(e.to_string()))?;

        let cancel = sink.cancellation();
        let mut state = RunState::default();

        // ── Stage 1: generation ────────────────────────────────────────
        self.push(sink, &mut state, CouncilEvent::Stage1Start);

        let (answers, stage1_kinds) = self.run_stage1(prompt, &cancel, &mut state).await;

        if !answers.iter().any(Stage1Answer::is_ok) {
            warn!(%run_id, "Stage 1 produced no usable answers");
            self.push(
                sink,
                &mut state,
                CouncilEvent::Error {
                    message: STAGE1_ALL_FAILED.to_string(),
                },
            );
            // A completely failed stage is an empty list, never absent.
            let trace = self.assemble_trace(None, None, None, state.errors.clone());
            let message = AssistantMessage::new(vec![], vec![], None, trace);
            let (message, _) = self.commit(conversation_id, message, sink, &mut state, false)?;
            return Ok(message);
        }

        let label_map = match LabelMap::assign(&answers) {
            Ok(map) => map,
            Err(fatal) => {
                let _ = sink.emit(CouncilEvent::Error {
                    message: fatal.to_string(),
                });
                return Err(fatal);
            }
        };
        let public = label_map.to_public(&answers);
        let answer_texts = label_map.answer_texts(&answers);

        self.push(
            sink,
            &mut state,
            CouncilEvent::Stage1Complete {
                data: answers.clone(),
            },
        );

        // ── Stage 2: anonymized peer judging ───────────────────────────
        self.push(sink, &mut state, CouncilEvent::Stage2Start);

        let parser = RankingParser::new(label_map.labels());
        let judgements = self
            .run_stage2(prompt, &public, &answer_texts, &stage1_kinds, &parser, &cancel, &mut state)
            .await;

        let mut metrics = ConsensusScorer::score(&judgements, &label_map);
        if metrics.non_partial == 0 {
            state.record(TraceError::new(
                "stage2",
                ErrorKind::ConsensusUndefined,
                "no non-partial judgements; falling back to the stage-1 order",
            ));
        }

        let snapshot =
            self.assemble_trace(Some(&label_map), Some(&metrics), None, state.errors.clone());
        self.push(
            sink,
            &mut state,
            CouncilEvent::Stage2Complete {
                data: judgements.clone(),
                metadata: snapshot,
            },
        );

        // ── Optional adjudication ──────────────────────────────────────
        let adjudication = self
            .run_adjudication(prompt, &public, &judgements, &parser, &answer_texts, &mut metrics, &cancel, &mut state)
            .await;

        // ── Stage 3: chairman synthesis ────────────────────────────────
        // With all judges partial the base defaults to the first label.
        let base_label = metrics
            .top1_consensus
            .or_else(|| label_map.labels().first().copied())
            .expect("label map verified non-empty");

        self.push(sink, &mut state, CouncilEvent::Stage3Start);

        let stage3 = self
            .run_stage3(prompt, &public, base_label, &metrics, &label_map, &cancel, &mut state)
            .await;

        self.push(
            sink,
            &mut state,
            CouncilEvent::Stage3Complete {
                data: stage3.clone(),
            },
        );

        // ── Title (best effort) ────────────────────────────────────────
        let title = self.generate_title(prompt, &cancel).await;
        self.apply_title(conversation_id, &title);
        self.push(
            sink,
            &mut state,
            CouncilEvent::TitleComplete {
                title: Some(title),
            },
        );

        // ── Assemble and commit ────────────────────────────────────────
        let trace = self.assemble_trace(
            Some(&label_map),
            Some(&metrics),
            adjudication,
            state.errors.clone(),
        );
        let message = AssistantMessage::new(answers, judgements, stage3, trace);
        let (message, stored) = self.commit(conversation_id, message, sink, &mut state, true)?;

        if stored {
            info!(%run_id, "Council run complete");
        }
        Ok(message)
    }

    async fn run_stage1(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> (Vec<Stage1Answer>, Vec<Option<ModelErrorKind>>) {
        let tasks = self
            .config
            .members
            .iter()
            .map(|member| ModelTask {
                model_id: member.model_id.clone(),
                system_prompt: member.role.system_prompt().to_string(),
                user_prompt: prompt.to_string(),
            })
            .collect();

        let results = self
            .runner
            .run_all(tasks, self.config.timeouts.stage1, cancel)
            .await;

        let mut answers = Vec::with_capacity(results.len());
        let mut kinds = Vec::with_capacity(results.len());
        for (member, result) in self.config.members.iter().zip(results) {
            let role = member.role.name();
            match result.outcome {
                Ok(text) => {
                    answers.push(Stage1Answer::ok(
                        &member.model_id,
                        role,
                        text,
                        result.latency_ms,
                    ));
                    kinds.push(None);
                }
                Err(error) => {
                    state.record(TraceError::for_model(
                        "stage1",
                        &member.model_id,
                        error.kind.into(),
                        error.message.clone(),
                    ));
                    answers.push(Stage1Answer::failed(
                        &member.model_id,
                        role,
                        error.message,
                        result.latency_ms,
                    ));
                    kinds.push(Some(error.kind));
                }
            }
        }
        (answers, kinds)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage2(
        &self,
        prompt: &str,
        public: &[PublicAnswer],
        answer_texts: &BTreeMap<Label, String>,
        stage1_kinds: &[Option<ModelErrorKind>],
        parser: &RankingParser,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Vec<Judgement> {
        // Judges are the council minus members whose stage-1 call failed
        // permanently; a transient miss keeps the seat on the panel.
        let judge_prompt = prompts::judge_prompt(prompt, public);
        let tasks: Vec<ModelTask> = self
            .config
            .members
            .iter()
            .zip(stage1_kinds)
            .filter(|(_, kind)| **kind != Some(ModelErrorKind::Permanent))
            .map(|(member, _)| ModelTask {
                model_id: member.model_id.clone(),
                system_prompt: Role::Judge.system_prompt().to_string(),
                user_prompt: judge_prompt.clone(),
            })
            .collect();

        let results = self
            .runner
            .run_all(tasks, self.config.timeouts.stage2, cancel)
            .await;

        results
            .into_iter()
            .map(|result| self.judgement_from(result, parser, answer_texts, state, "stage2"))
            .collect()
    }

    /// Parse one judge slot, recording trace errors for failed calls and
    /// unusable rankings.
    fn judgement_from(
        &self,
        result: TaskResult,
        parser: &RankingParser,
        answer_texts: &BTreeMap<Label, String>,
        state: &mut RunState,
        stage: &str,
    ) -> Judgement {
        match result.outcome {
            Ok(text) => {
                let judgement = parser.parse(&result.model_id, &text, answer_texts);
                if judgement.partial {
                    state.record(TraceError::for_model(
                        stage,
                        &result.model_id,
                        ErrorKind::ParseFailure,
                        format!(
                            "judgement marked partial: {:?}",
                            judgement.partial_reason
                        ),
                    ));
                }
                judgement
            }
            Err(error) => {
                state.record(TraceError::for_model(
                    stage,
                    &result.model_id,
                    error.kind.into(),
                    error.message,
                ));
                let reason = match error.kind {
                    ModelErrorKind::Timeout => PartialReason::Timeout,
                    _ => PartialReason::ModelError,
                };
                Judgement::failed(&result.model_id, reason)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_adjudication(
        &self,
        prompt: &str,
        public: &[PublicAnswer],
        judgements: &[Judgement],
        parser: &RankingParser,
        answer_texts: &BTreeMap<Label, String>,
        metrics: &mut ConsensusMetrics,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Option<AdjudicationRecord> {
        let adjudicator_model = self.config.adjudicator_model_id.as_ref()?;
        let reason = self.policy.trigger(metrics)?;

        let task = ModelTask {
            model_id: adjudicator_model.clone(),
            system_prompt: Role::Adjudicator.system_prompt().to_string(),
            user_prompt: self.policy.prompt(prompt, public, judgements),
        };
        let result = self
            .runner
            .run_all(vec![task], self.config.timeouts.stage2, cancel)
            .await
            .into_iter()
            .next()?;

        let mut judgement =
            self.judgement_from(result, parser, answer_texts, state, "adjudication");
        judgement.adjudicator = true;

        if judgement.partial {
            state.record(TraceError::for_model(
                "adjudication",
                adjudicator_model,
                ErrorKind::ParseFailure,
                "adjudicator ranking unusable; keeping the original consensus",
            ));
        } else if let Some(top) = judgement.parsed_ranking.first() {
            debug!(label = %top, "Adjudicator overrode top-1 consensus");
            metrics.top1_consensus = Some(*top);
        }

        Some(AdjudicationRecord {
            triggered_reason: reason,
            result: judgement,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage3(
        &self,
        prompt: &str,
        public: &[PublicAnswer],
        base_label: Label,
        metrics: &ConsensusMetrics,
        label_map: &LabelMap,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Option<Stage3Result> {
        let task = ModelTask {
            model_id: self.config.chairman_model_id.clone(),
            system_prompt: Role::Chairman.system_prompt().to_string(),
            user_prompt: prompts::chairman_prompt(prompt, public, base_label, metrics),
        };
        let result = self
            .runner
            .run_all(vec![task], self.config.timeouts.stage3, cancel)
            .await
            .into_iter()
            .next()?;

        match result.outcome {
            Ok(text) => Some(parse_chairman(
                &self.config.chairman_model_id,
                &text,
                label_map,
                base_label,
            )),
            Err(error) => {
                state.record(TraceError::for_model(
                    "stage3",
                    &self.config.chairman_model_id,
                    error.kind.into(),
                    error.message,
                ));
                None
            }
        }
    }

    /// One-shot title call with the stage-1 prompt; falls back to a textual
    /// derivation so titling never fails.
    async fn generate_title(&self, prompt: &str, cancel: &CancellationToken) -> String {
        let task = ModelTask {
            model_id: self.config.chairman_model_id.clone(),
            system_prompt: prompts::TITLE_SYSTEM_PROMPT.to_string(),
            user_prompt: prompts::title_prompt(prompt),
        };
        let result = self
            .runner
            .run_all(vec![task], self.config.timeouts.title, cancel)
            .await
            .into_iter()
            .next();

        match result.map(|r| r.outcome) {
            Some(Ok(text)) => {
                let title = sanitize_title(&text);
                if title.is_empty() {
                    derive_title(prompt)
                } else {
                    title
                }
            }
            _ => {
                debug!("Title call failed; deriving from the prompt");
                derive_title(prompt)
            }
        }
    }

    fn apply_title(&self, conversation_id: &str, title: &str) {
        match self.store.load(conversation_id) {
            Ok(conversation) if conversation.title == DEFAULT_TITLE => {
                if let Err(e) = self.store.set_title(conversation_id, title) {
                    warn!(conversation_id, error = %e, "Failed to store title");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(conversation_id, error = %e, "Failed to load conversation for titling"),
        }
    }

    fn assemble_trace(
        &self,
        label_map: Option<&LabelMap>,
        metrics: Option<&ConsensusMetrics>,
        adjudication: Option<AdjudicationRecord>,
        errors: Vec<TraceError>,
    ) -> DecisionTrace {
        let mut model_roles = BTreeMap::new();
        if let Some(map) = label_map {
            for member in &self.config.members {
                if map.label_of(&member.model_id).is_some() {
                    model_roles.insert(member.model_id.clone(), member.role.name().to_string());
                }
            }
            model_roles.insert(
                self.config.chairman_model_id.clone(),
                Role::Chairman.name().to_string(),
            );
        }

        DecisionTrace {
            label_to_model: label_map.map(LabelMap::label_to_model).unwrap_or_default(),
            aggregate_rankings: metrics
                .map(|m| m.aggregate_rankings.clone())
                .unwrap_or_default(),
            model_roles,
            errors,
            top1_consensus: metrics.and_then(|m| m.top1_consensus),
            evidence_ok_rate: metrics.map(|m| m.evidence_ok_rate).unwrap_or(0.0),
            partial_rate: metrics.map(|m| m.partial_rate).unwrap_or(0.0),
            adjudication,
        }
    }

    /// Append the assistant message; a failed final append is the one
    /// mid-run error that also emits an `error` event, because the user's
    /// work must not be silently lost.
    fn commit(
        &self,
        conversation_id: &str,
        message: AssistantMessage,
        sink: &EventStream,
        state: &mut RunState,
        emit_complete: bool,
    ) -> PipelineResult<(AssistantMessage, bool)> {
        match self.store.append_message(
            conversation_id,
            StoredMessage::Assistant(Box::new(message.clone())),
        ) {
            Ok(()) => {
                if emit_complete {
                    self.push(sink, state, CouncilEvent::Complete);
                }
                Ok((message, true))
            }
            Err(store_error) => {
                warn!(conversation_id, error = %store_error, "Final append failed");
                let trace_error = TraceError::new(
                    "store",
                    ErrorKind::StoreFailure,
                    store_error.to_string(),
                );
                let mut message = message;
                message.meta.errors.push(trace_error.clone());
                message.metadata.errors.push(trace_error);
                self.push(
                    sink,
                    state,
                    CouncilEvent::Error {
                        message: format!("failed to persist the run: {store_error}"),
                    },
                );
                Ok((message, false))
            }
        }
    }

    /// Emit unless the client already went away; on the first failed send,
    /// flip the run's cancellation token so outstanding model calls abort.
    fn push(&self, sink: &EventStream, state: &mut RunState, event: CouncilEvent) {
        if state.disconnected {
            return;
        }
        let event_type = event.event_type();
        if sink.emit(event).is_err() {
            warn!(event_type, "Client disconnected; aborting outstanding model calls");
            state.disconnected = true;
            sink.cancel();
            state.record(TraceError::new(
                "events",
                ErrorKind::ClientDisconnected,
                "client disconnected mid-run; results are persisted, delivery stopped",
            ));
        }
    }
}

/// Minimal parse of the Chairman's output: body text plus optional
/// `BASE:` / `MERGED:` / `REJECTED:` structured lines. The base defaults to
/// the consensus label when the Chairman omitted or mangled it.
fn parse_chairman(
    model_id: &str,
    raw: &str,
    label_map: &LabelMap,
    default_base: Label,
) -> Stage3Result {
    let mut base_label = default_base;
    let mut contributors = Vec::new();
    let mut rejections = Vec::new();
    let mut body = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = strip_marker(&lower, trimmed, "base:") {
            if let Some(label) = first_known_label(&rest, label_map) {
                base_label = label;
            }
        } else if let Some(rest) = strip_marker(&lower, trimmed, "merged:") {
            if let Some(label) = first_known_label(&rest, label_map) {
                let (reason, dimension) = split_reason_dimension(&rest);
                contributors.push(Contributor {
                    label,
                    reason,
                    dimension,
                });
            }
        } else if let Some(rest) = strip_marker(&lower, trimmed, "rejected:") {
            if let Some(label) = first_known_label(&rest, label_map) {
                let (point, reason) = split_point_reason(&rest);
                rejections.push(Rejection {
                    label,
                    point,
                    reason,
                });
            }
        } else {
            body.push(line);
        }
    }

    Stage3Result {
        model_id: model_id.to_string(),
        text: body.join("\n").trim().to_string(),
        base_label,
        contributors,
        rejections,
    }
}

fn strip_marker(lower: &str, original: &str, marker: &str) -> Option<String> {
    lower
        .starts_with(marker)
        .then(|| original[marker.len()..].trim().to_string())
}

fn first_known_label(text: &str, label_map: &LabelMap) -> Option<Label> {
    extract_label_chain(text)
        .into_iter()
        .find(|label| label_map.contains(*label))
}

/// `Response X - <reason> (<dimension>)` → (reason, dimension).
fn split_reason_dimension(rest: &str) -> (String, String) {
    let after_label = rest.split_once('-').map(|(_, r)| r.trim()).unwrap_or("");
    match after_label.rsplit_once('(') {
        Some((reason, dimension)) => (
            reason.trim().to_string(),
            dimension.trim_end_matches(')').trim().to_string(),
        ),
        None => (after_label.to_string(), String::new()),
    }
}

/// `Response X - <point> - <reason>` → (point, reason).
fn split_point_reason(rest: &str) -> (String, String) {
    let mut parts = rest.splitn(3, '-').map(str::trim);
    let _label = parts.next();
    let point = parts.next().unwrap_or("").to_string();
    let reason = parts.next().unwrap_or("").to_string();
    (point, reason)
}

/// Fallback title: first meaningful line of the prompt, markdown markers
/// stripped, capped at 8 words and 60 characters.
fn derive_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let cleaned: String = line
        .chars()
        .filter(|c| !matches!(c, '`' | '*' | '_' | '>' | '#'))
        .collect();
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let truncated = words.len() > 8;
    words.truncate(8);
    let mut title = words.join(" ");
    if title.len() > 60 {
        title.truncate(60);
        title = title.trim_end().to_string();
    }
    if truncated {
        title.push('…');
    }
    title
}

/// First line of a title completion, cleaned the same way.
fn sanitize_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let cleaned: String = line
        .chars()
        .filter(|c| !matches!(c, '`' | '*' | '_' | '>' | '#' | '"'))
        .collect();
    let mut title = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.len() > 60 {
        title.truncate(60);
        title = title.trim_end().to_string();
    }
    title.trim_end_matches(['.', '!']).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> LabelMap {
        let answers = vec![
            Stage1Answer::ok("m1", "Builder", "a".into(), 1),
            Stage1Answer::ok("m2", "Skeptic", "b".into(), 1),
        ];
        LabelMap::assign(&answers).unwrap()
    }

    fn label(letter: char) -> Label {
        Label::from_letter(letter).unwrap()
    }

    #[test]
    fn test_parse_chairman_structured_lines() {
        let raw = "Here is the final answer.\n\
                   It uses the guard from the second response.\n\
                   BASE: Response A\n\
                   MERGED: Response B - adds the overflow guard (risk_safety)\n\
                   REJECTED: Response B - rewrite in assembly - unjustified complexity";
        let result = parse_chairman("chair", raw, &map(), label('B'));

        assert_eq!(result.base_label, label('A'));
        assert_eq!(result.contributors.len(), 1);
        assert_eq!(result.contributors[0].label, label('B'));
        assert_eq!(result.contributors[0].dimension, "risk_safety");
        assert_eq!(result.rejections.len(), 1);
        assert_eq!(result.rejections[0].point, "rewrite in assembly");
        assert!(result.text.starts_with("Here is the final answer."));
        assert!(!result.text.contains("BASE:"));
    }

    #[test]
    fn test_parse_chairman_defaults_base_when_absent() {
        let result = parse_chairman("chair", "Just the answer.", &map(), label('B'));
        assert_eq!(result.base_label, label('B'));
        assert_eq!(result.text, "Just the answer.");
        assert!(result.contributors.is_empty());
    }

    #[test]
    fn test_parse_chairman_ignores_unknown_base_label() {
        let result = parse_chairman("chair", "Answer.\nBASE: Response Q", &map(), label('A'));
        assert_eq!(result.base_label, label('A'));
    }

    #[test]
    fn test_derive_title_caps_words() {
        let title = derive_title("# How do I structure a retry loop with jitter in my client code?");
        assert!(title.starts_with("How do I structure a retry loop"));
        assert!(title.ends_with('…'));
        assert!(!title.contains('#'));
    }

    #[test]
    fn test_derive_title_empty_prompt() {
        assert_eq!(derive_title("   \n  "), DEFAULT_TITLE);
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("\"Retry Loops 101.\"\nextra"), "Retry Loops 101");
        assert_eq!(sanitize_title(""), "");
    }
}
