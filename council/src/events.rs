//! Stage lifecycle events pushed to the client while a run executes.
//!
//! Events are a closed tagged union; clients must ignore `type` values they
//! do not recognize. Delivery is push-only over a per-run channel: the
//! receiving side is the transport (SSE writer, test collector), and a send
//! failure is the abort signal the orchestrator turns into cancellation.
//! Dropped deliveries never abort the pipeline itself — the decision trace
//! is still committed.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{AssistantMessage, DecisionTrace, Judgement, Stage1Answer, Stage3Result};

/// Everything a client can observe about a run, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    Stage1Start,
    Stage1Complete {
        data: Vec<Stage1Answer>,
    },
    Stage2Start,
    Stage2Complete {
        data: Vec<Judgement>,
        metadata: DecisionTrace,
    },
    Stage3Start,
    Stage3Complete {
        #[serde(with = "crate::types::stage3_or_empty")]
        data: Option<Stage3Result>,
    },
    TitleComplete {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        title: Option<String>,
    },
    Complete,
    Error {
        message: String,
    },
}

impl CouncilEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Stage1Start => "stage1_start",
            Self::Stage1Complete { .. } => "stage1_complete",
            Self::Stage2Start => "stage2_start",
            Self::Stage2Complete { .. } => "stage2_complete",
            Self::Stage3Start => "stage3_start",
            Self::Stage3Complete { .. } => "stage3_complete",
            Self::TitleComplete { .. } => "title_complete",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Render one event as a line-delimited SSE record: `data: {json}\n\n`.
pub fn sse_frame(event: &CouncilEvent) -> String {
    // CouncilEvent serialization cannot fail: no maps with non-string keys,
    // no non-finite floats reachable here.
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Synthesize the event sequence a streaming client would have seen from a
/// finished assistant message (the non-streaming JSON fallback).
pub fn synthesize_events(message: &AssistantMessage) -> Vec<CouncilEvent> {
    let mut events = vec![
        CouncilEvent::Stage1Start,
        CouncilEvent::Stage1Complete {
            data: message.stage1.clone(),
        },
        CouncilEvent::Stage2Start,
        CouncilEvent::Stage2Complete {
            data: message.stage2.clone(),
            metadata: message.meta.clone(),
        },
        CouncilEvent::Stage3Start,
        CouncilEvent::Stage3Complete {
            data: message.stage3.clone(),
        },
    ];
    events.push(CouncilEvent::TitleComplete { title: None });
    events.push(CouncilEvent::Complete);
    events
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink closed: client disconnected")]
    Disconnected,
}

/// Push-only sink for one run.
///
/// `channel()` pairs the sink with a receiver for a streaming transport;
/// `detached()` builds a sink that swallows events for the non-streaming
/// path. Either way the sink owns the run's cancellation token.
#[derive(Clone)]
pub struct EventStream {
    tx: Option<mpsc::UnboundedSender<CouncilEvent>>,
    cancel: CancellationToken,
}

impl EventStream {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CouncilEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// A sink with no transport attached; emits succeed and vanish.
    pub fn detached() -> Self {
        Self {
            tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Push one event. `Err` means the client went away; the caller decides
    /// whether to cancel outstanding work.
    pub fn emit(&self, event: CouncilEvent) -> Result<(), SinkError> {
        match &self.tx {
            Some(tx) => tx.send(event).map_err(|_| SinkError::Disconnected),
            None => Ok(()),
        }
    }

    /// The run's cancellation token, shared with the stage runner.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecisionTrace;

    #[test]
    fn test_event_type_tags() {
        let json = serde_json::to_value(CouncilEvent::Stage1Start).unwrap();
        assert_eq!(json["type"], "stage1_start");

        let json = serde_json::to_value(CouncilEvent::Stage2Complete {
            data: vec![],
            metadata: DecisionTrace::empty(),
        })
        .unwrap();
        assert_eq!(json["type"], "stage2_complete");
        assert!(json.get("data").is_some());
        assert!(json.get("metadata").is_some());

        let json = serde_json::to_value(CouncilEvent::Complete).unwrap();
        assert_eq!(json["type"], "complete");
    }

    #[test]
    fn test_stage3_complete_serializes_empty_object() {
        let json = serde_json::to_value(CouncilEvent::Stage3Complete { data: None }).unwrap();
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn test_event_type_accessor_matches_serde_tag() {
        let events = vec![
            CouncilEvent::Stage1Start,
            CouncilEvent::Stage1Complete { data: vec![] },
            CouncilEvent::Stage2Start,
            CouncilEvent::Stage2Complete {
                data: vec![],
                metadata: DecisionTrace::empty(),
            },
            CouncilEvent::Stage3Start,
            CouncilEvent::Stage3Complete { data: None },
            CouncilEvent::TitleComplete { title: None },
            CouncilEvent::Complete,
            CouncilEvent::Error {
                message: "boom".into(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn test_sse_frame_shape() {
        let frame = sse_frame(&CouncilEvent::Stage1Start);
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"stage1_start\""));
    }

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (sink, mut rx) = EventStream::channel();
        sink.emit(CouncilEvent::Stage1Start).unwrap();
        sink.emit(CouncilEvent::Complete).unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type(), "stage1_start");
        assert_eq!(rx.recv().await.unwrap().event_type(), "complete");
    }

    #[tokio::test]
    async fn test_emit_after_receiver_drop_reports_disconnect() {
        let (sink, rx) = EventStream::channel();
        drop(rx);
        assert!(matches!(
            sink.emit(CouncilEvent::Stage1Start),
            Err(SinkError::Disconnected)
        ));
    }

    #[test]
    fn test_detached_sink_swallows_events() {
        let sink = EventStream::detached();
        assert!(sink.emit(CouncilEvent::Complete).is_ok());
        assert!(!sink.is_cancelled());
        sink.cancel();
        assert!(sink.is_cancelled());
    }

    #[test]
    fn test_synthesize_events_matches_streaming_order() {
        let message = crate::types::AssistantMessage::new(
            vec![],
            vec![],
            None,
            DecisionTrace::empty(),
        );
        let types: Vec<&str> = synthesize_events(&message)
            .iter()
            .map(CouncilEvent::event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                "stage1_start",
                "stage1_complete",
                "stage2_start",
                "stage2_complete",
                "stage3_start",
                "stage3_complete",
                "title_complete",
                "complete",
            ]
        );
    }

    #[test]
    fn test_unknown_future_type_roundtrip_is_rejected_not_crashing() {
        // The enum itself rejects unknown tags; transports that need to
        // tolerate them parse to serde_json::Value first.
        let parsed: Result<CouncilEvent, _> =
            serde_json::from_str(r#"{"type":"stage9_start"}"#);
        assert!(parsed.is_err());
    }
}
