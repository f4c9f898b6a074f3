//! Anonymization layer.
//!
//! Assigns labels `A, B, C, …` to the non-errored stage-1 answers in their
//! config-index order. The forward map (label → model) lives only in the
//! orchestrator's decision trace; the public view handed to judge prompts
//! carries labels and text and nothing else.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Label, Stage1Answer, MAX_LABELS};

/// A labelled answer as judges see it: no model identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAnswer {
    pub label: Label,
    pub text: String,
}

/// Injective, run-stable mapping between labels and the models whose
/// stage-1 answers survived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelMap {
    entries: Vec<(Label, String)>,
}

impl LabelMap {
    /// Label the non-errored answers in order, skipping failures. Rejects
    /// councils that would exhaust the single-letter alphabet.
    pub fn assign(answers: &[Stage1Answer]) -> PipelineResult<Self> {
        let survivors: Vec<&Stage1Answer> = answers.iter().filter(|a| a.is_ok()).collect();
        if survivors.len() > MAX_LABELS {
            return Err(PipelineError::TooManyAnswers(survivors.len()));
        }

        let entries = survivors
            .iter()
            .enumerate()
            .map(|(i, answer)| {
                // `i < MAX_LABELS` is guaranteed by the length check above.
                (Label::at(i).unwrap(), answer.model_id.clone())
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn labels(&self) -> Vec<Label> {
        self.entries.iter().map(|(label, _)| *label).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model_of(&self, label: Label) -> Option<&str> {
        self.entries
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, m)| m.as_str())
    }

    pub fn label_of(&self, model_id: &str) -> Option<Label> {
        self.entries
            .iter()
            .find(|(_, m)| m == model_id)
            .map(|(l, _)| *l)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.model_of(label).is_some()
    }

    /// The forward map as stored in the decision trace.
    pub fn label_to_model(&self) -> BTreeMap<Label, String> {
        self.entries.iter().cloned().collect()
    }

    /// De-identified view for stage-2 prompts: `{label, text}` pairs only.
    pub fn to_public(&self, answers: &[Stage1Answer]) -> Vec<PublicAnswer> {
        // Survivor order here matches assignment order, so labels and texts
        // stay aligned without touching model ids.
        answers
            .iter()
            .filter(|a| a.is_ok())
            .zip(self.entries.iter())
            .map(|(answer, (label, _))| PublicAnswer {
                label: *label,
                text: answer.text.clone(),
            })
            .collect()
    }

    /// Label texts back to their models: the inverse of anonymization.
    pub fn deanonymize(&self, public: &[PublicAnswer]) -> BTreeMap<String, String> {
        public
            .iter()
            .filter_map(|p| {
                self.model_of(p.label)
                    .map(|model| (model.to_string(), p.text.clone()))
            })
            .collect()
    }

    /// Per-label answer text, used by the parser's evidence rule.
    pub fn answer_texts(&self, answers: &[Stage1Answer]) -> BTreeMap<Label, String> {
        self.to_public(answers)
            .into_iter()
            .map(|p| (p.label, p.text))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(model: &str, text: &str) -> Stage1Answer {
        Stage1Answer::ok(model, "Builder", text.to_string(), 5)
    }

    fn failed(model: &str) -> Stage1Answer {
        Stage1Answer::failed(model, "Skeptic", "HTTP 401".to_string(), 5)
    }

    #[test]
    fn test_assign_skips_errored_answers() {
        let answers = vec![answer("m1", "one"), failed("m2"), answer("m3", "three")];
        let map = LabelMap::assign(&answers).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.model_of(Label::at(0).unwrap()), Some("m1"));
        assert_eq!(map.model_of(Label::at(1).unwrap()), Some("m3"));
        assert_eq!(map.label_of("m2"), None);
    }

    #[test]
    fn test_bijection() {
        let answers = vec![answer("m1", "a"), answer("m2", "b"), answer("m3", "c")];
        let map = LabelMap::assign(&answers).unwrap();

        for label in map.labels() {
            let model = map.model_of(label).unwrap();
            assert_eq!(map.label_of(model), Some(label));
        }
    }

    #[test]
    fn test_public_view_has_no_model_ids() {
        let answers = vec![answer("secret-model-1", "alpha"), answer("secret-model-2", "beta")];
        let map = LabelMap::assign(&answers).unwrap();
        let public = map.to_public(&answers);

        let rendered = serde_json::to_string(&public).unwrap();
        assert!(!rendered.contains("secret-model"));
        assert_eq!(public[0].text, "alpha");
        assert_eq!(public[1].label, Label::at(1).unwrap());
    }

    #[test]
    fn test_anonymize_roundtrip() {
        let answers = vec![answer("m1", "first text"), answer("m2", "second text")];
        let map = LabelMap::assign(&answers).unwrap();
        let recovered = map.deanonymize(&map.to_public(&answers));

        assert_eq!(recovered.get("m1").map(String::as_str), Some("first text"));
        assert_eq!(recovered.get("m2").map(String::as_str), Some("second text"));
    }

    #[test]
    fn test_too_many_answers_rejected() {
        let answers: Vec<Stage1Answer> = (0..27)
            .map(|i| answer(&format!("m{i}"), "text"))
            .collect();
        assert!(matches!(
            LabelMap::assign(&answers),
            Err(PipelineError::TooManyAnswers(27))
        ));
    }

    #[test]
    fn test_empty_map() {
        let map = LabelMap::assign(&[failed("m1")]).unwrap();
        assert!(map.is_empty());
        assert!(map.labels().is_empty());
    }
}
