//! Multi-model deliberation pipeline.
//!
//! One prompt fans out to a council of models, each answering under a fixed
//! role; the same panel then peer-reviews the anonymized answers under a
//! strict 5-line critique contract; an adjudicator re-judges when consensus
//! is weak; and a Chairman synthesizes the single final answer. Stage
//! progress streams to the client as tagged events, and every run persists
//! a decision trace for post-hoc audit.
//!
//! # Pipeline
//!
//! ```text
//! prompt ─▶ Stage 1: council fan-out (Builder/Skeptic/Minimalist/Auditor)
//!        ─▶ anonymize: Response A..N (failed answers skipped)
//!        ─▶ Stage 2: judge fan-out ─▶ RankingParser ─▶ ConsensusScorer
//!        ─▶ [adjudication when consensus is weak]
//!        ─▶ Stage 3: Chairman synthesis
//!        ─▶ decision trace ─▶ conversation store
//! ```
//!
//! The HTTP surface, frontend, and real model gateway are external
//! collaborators; this crate exposes their contracts ([`ModelClient`],
//! [`ConversationStore`], [`CouncilEvent`]) and a reqwest-backed
//! [`OpenRouterClient`] for OpenAI-compatible gateways.

pub mod adjudication;
pub mod anonymize;
pub mod client;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod prompts;
pub mod ranking;
pub mod roles;
pub mod runner;
pub mod storage;
pub mod types;

// Re-export the boundary types callers actually touch.
pub use adjudication::AdjudicationPolicy;
pub use anonymize::{LabelMap, PublicAnswer};
pub use client::{ModelClient, ModelError, ModelErrorKind, OpenRouterClient};
pub use config::{CouncilConfig, CouncilMember, RetryPolicy, StageTimeouts};
pub use consensus::{ConsensusMetrics, ConsensusScorer};
pub use error::{ErrorKind, PipelineError, PipelineResult, TraceError};
pub use events::{sse_frame, synthesize_events, CouncilEvent, EventStream, SinkError};
pub use orchestrator::Orchestrator;
pub use ranking::RankingParser;
pub use roles::Role;
pub use runner::{ModelTask, StageRunner, TaskResult};
pub use storage::{
    Conversation, ConversationStore, ConversationSummary, FileStore, MemoryStore, StoreError,
    StoredMessage, UserMessage,
};
pub use types::{
    AdjudicationRecord, AggregateRanking, AssistantMessage, Contributor, DecisionTrace, Judgement,
    Label, LabelCritique, PartialReason, Rejection, Stage1Answer, Stage3Result,
};
