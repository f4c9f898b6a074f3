//! Core data model for a deliberation run.
//!
//! Everything here is created during a single run (one user message) and is
//! immutable once the orchestrator assembles the [`DecisionTrace`]. Judgements
//! reference labels by value; there are no back-pointers into stage-1 data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Anonymous identity of one stage-1 answer: a single letter `A..Z`.
///
/// Labels serialize as the bare letter (`"A"`); prompts render the long form
/// via [`Label::display_name`] (`Response A`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(char);

/// Largest supported council size; two-letter labels are rejected until
/// their ordering is specified.
pub const MAX_LABELS: usize = 26;

impl Label {
    /// Label for a zero-based position: 0 → A, 1 → B, …
    pub fn at(index: usize) -> Option<Self> {
        if index < MAX_LABELS {
            Some(Self((b'A' + index as u8) as char))
        } else {
            None
        }
    }

    /// Parse a letter, case-insensitively.
    pub fn from_letter(letter: char) -> Option<Self> {
        let upper = letter.to_ascii_uppercase();
        upper.is_ascii_uppercase().then_some(Self(upper))
    }

    pub fn letter(&self) -> char {
        self.0
    }

    /// The long form used in prompts: `Response A`.
    pub fn display_name(&self) -> String {
        format!("Response {}", self.0)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut buf = [0u8; 4];
        serializer.serialize_str(self.0.encode_utf8(&mut buf))
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LabelVisitor;

        impl Visitor<'_> for LabelVisitor {
            type Value = Label;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a single letter A-Z")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Label, E> {
                let mut chars = v.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => {
                        Label::from_letter(c).ok_or_else(|| E::custom("label must be A-Z"))
                    }
                    _ => Err(E::custom("label must be a single letter")),
                }
            }
        }

        deserializer.deserialize_str(LabelVisitor)
    }
}

/// One council member's stage-1 output. Produced exactly once per member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Answer {
    pub model_id: String,
    pub role_name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl Stage1Answer {
    pub fn ok(model_id: &str, role_name: &str, text: String, latency_ms: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            role_name: role_name.to_string(),
            text,
            error: None,
            latency_ms,
        }
    }

    pub fn failed(model_id: &str, role_name: &str, error: String, latency_ms: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            role_name: role_name.to_string(),
            text: String::new(),
            error: Some(error),
            latency_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a judge's ranking could not be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    EmptyText,
    LineCount,
    Placeholder,
    RankingInvalid,
    ModelError,
    Timeout,
}

/// Per-label critique extracted from a judge's 5-line block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelCritique {
    pub strength: String,
    pub flaw: String,
    /// Evidence tokens that were verified against the labelled answer text.
    /// Empty means the critique failed the evidence rule.
    pub evidence_tokens: Vec<String>,
}

impl LabelCritique {
    pub fn is_evidence_ok(&self) -> bool {
        !self.evidence_tokens.is_empty()
    }
}

/// One stage-2 judge's verdict over the anonymized answer set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub model_id: String,
    /// Verbatim model output.
    pub raw_text: String,
    /// The repaired (possibly coerced) 5-line block the parser settled on.
    pub ranking_text: String,
    /// Ordered labels, best first. Empty when the ranking was unusable.
    pub parsed_ranking: Vec<Label>,
    pub per_label_critiques: BTreeMap<Label, LabelCritique>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partial_reason: Option<PartialReason>,
    /// The parser repaired malformed line structure.
    pub format_fix_used: bool,
    /// The ranking was completed heuristically.
    pub coerced: bool,
    /// True only for the adjudication re-judge.
    pub adjudicator: bool,
}

impl Judgement {
    /// A judgement for a judge whose model call never produced text.
    pub fn failed(model_id: &str, reason: PartialReason) -> Self {
        Self {
            model_id: model_id.to_string(),
            raw_text: String::new(),
            ranking_text: String::new(),
            parsed_ranking: Vec::new(),
            per_label_critiques: BTreeMap::new(),
            partial: true,
            partial_reason: Some(reason),
            format_fix_used: false,
            coerced: false,
            adjudicator: false,
        }
    }

    /// Fraction of labels whose critique passed the evidence rule.
    pub fn evidence_ok_ratio(&self, label_count: usize) -> f64 {
        if label_count == 0 {
            return 0.0;
        }
        let ok = self
            .per_label_critiques
            .values()
            .filter(|c| c.is_evidence_ok())
            .count();
        ok as f64 / label_count as f64
    }
}

/// An improvement the Chairman pulled in from a non-base answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub label: Label,
    pub reason: String,
    pub dimension: String,
}

/// A suggestion the Chairman explicitly declined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub label: Label,
    pub point: String,
    pub reason: String,
}

/// The Chairman's synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Result {
    pub model_id: String,
    pub text: String,
    pub base_label: Label,
    pub contributors: Vec<Contributor>,
    pub rejections: Vec<Rejection>,
}

/// Mean rank position of one model across non-partial judges. Lower is better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub model: String,
    pub average_rank: f64,
    pub rankings_count: u32,
}

/// Record of an adjudication pass, kept whether or not it overrode consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationRecord {
    pub triggered_reason: String,
    pub result: Judgement,
}

pub use crate::error::TraceError;

/// The persisted audit record: why this run concluded what it did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub label_to_model: BTreeMap<Label, String>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub model_roles: BTreeMap<String, String>,
    pub errors: Vec<TraceError>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub top1_consensus: Option<Label>,
    pub evidence_ok_rate: f64,
    pub partial_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub adjudication: Option<AdjudicationRecord>,
}

impl DecisionTrace {
    pub fn empty() -> Self {
        Self {
            label_to_model: BTreeMap::new(),
            aggregate_rankings: Vec::new(),
            model_roles: BTreeMap::new(),
            errors: Vec::new(),
            top1_consensus: None,
            evidence_ok_rate: 0.0,
            partial_rate: 0.0,
            adjudication: None,
        }
    }
}

/// The schema-stable assistant message handed to the conversation store.
///
/// `meta` and `metadata` are the same trace serialized twice; `stage3`
/// serializes as `{}` when the Chairman produced nothing. Empty stage lists
/// are the failure signal; no placeholder content is ever injected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub stage1: Vec<Stage1Answer>,
    pub stage2: Vec<Judgement>,
    #[serde(with = "stage3_or_empty")]
    pub stage3: Option<Stage3Result>,
    pub meta: DecisionTrace,
    pub metadata: DecisionTrace,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    pub fn new(
        stage1: Vec<Stage1Answer>,
        stage2: Vec<Judgement>,
        stage3: Option<Stage3Result>,
        trace: DecisionTrace,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            stage1,
            stage2,
            stage3,
            meta: trace.clone(),
            metadata: trace,
            timestamp: Utc::now(),
        }
    }
}

/// Serialize an absent stage-3 result as `{}` rather than `null`, and accept
/// `{}` back as `None`.
pub(crate) mod stage3_or_empty {
    use super::Stage3Result;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Stage3Result>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(result) => result.serialize(serializer),
            None => serde_json::Map::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Stage3Result>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_at() {
        assert_eq!(Label::at(0).unwrap().letter(), 'A');
        assert_eq!(Label::at(3).unwrap().letter(), 'D');
        assert_eq!(Label::at(25).unwrap().letter(), 'Z');
        assert!(Label::at(26).is_none());
    }

    #[test]
    fn test_label_display_name() {
        assert_eq!(Label::at(1).unwrap().display_name(), "Response B");
    }

    #[test]
    fn test_label_from_letter_case_insensitive() {
        assert_eq!(Label::from_letter('c'), Label::at(2));
        assert_eq!(Label::from_letter('C'), Label::at(2));
        assert_eq!(Label::from_letter('7'), None);
    }

    #[test]
    fn test_label_serde_roundtrip() {
        let label = Label::at(2).unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"C\"");
        let parsed: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, label);
    }

    #[test]
    fn test_label_as_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Label::at(0).unwrap(), "model-a".to_string());
        map.insert(Label::at(1).unwrap(), "model-b".to_string());
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"A":"model-a","B":"model-b"}"#);
        let parsed: BTreeMap<Label, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_label_deserialize_rejects_garbage() {
        assert!(serde_json::from_str::<Label>("\"AB\"").is_err());
        assert!(serde_json::from_str::<Label>("\"\"").is_err());
        assert!(serde_json::from_str::<Label>("\"3\"").is_err());
    }

    #[test]
    fn test_stage1_answer_error_field_elided_when_ok() {
        let answer = Stage1Answer::ok("m", "Builder", "hi".into(), 10);
        let json = serde_json::to_string(&answer).unwrap();
        assert!(!json.contains("error"));
        assert!(answer.is_ok());

        let failed = Stage1Answer::failed("m", "Builder", "boom".into(), 10);
        assert!(!failed.is_ok());
    }

    #[test]
    fn test_partial_reason_serde() {
        let json = serde_json::to_string(&PartialReason::RankingInvalid).unwrap();
        assert_eq!(json, "\"ranking_invalid\"");
    }

    #[test]
    fn test_evidence_ok_ratio() {
        let mut judgement = Judgement::failed("m", PartialReason::ModelError);
        judgement.per_label_critiques.insert(
            Label::at(0).unwrap(),
            LabelCritique {
                strength: "s".into(),
                flaw: "f".into(),
                evidence_tokens: vec!["quicksort".into()],
            },
        );
        judgement
            .per_label_critiques
            .insert(Label::at(1).unwrap(), LabelCritique::default());
        assert!((judgement.evidence_ok_ratio(2) - 0.5).abs() < f64::EPSILON);
        assert_eq!(judgement.evidence_ok_ratio(0), 0.0);
    }

    #[test]
    fn test_assistant_message_stage3_empty_object() {
        let message = AssistantMessage::new(vec![], vec![], None, DecisionTrace::empty());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["stage3"], serde_json::json!({}));
        assert_eq!(json["role"], "assistant");

        let back: AssistantMessage = serde_json::from_value(json).unwrap();
        assert!(back.stage3.is_none());
    }

    #[test]
    fn test_assistant_message_meta_metadata_identical() {
        let mut trace = DecisionTrace::empty();
        trace
            .label_to_model
            .insert(Label::at(0).unwrap(), "model-a".into());
        let message = AssistantMessage::new(vec![], vec![], None, trace);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["meta"], json["metadata"]);
    }

    #[test]
    fn test_assistant_message_has_five_contract_fields() {
        let message = AssistantMessage::new(vec![], vec![], None, DecisionTrace::empty());
        let json = serde_json::to_value(&message).unwrap();
        for field in ["stage1", "stage2", "stage3", "meta", "metadata"] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
