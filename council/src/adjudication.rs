//! Adjudication policy.
//!
//! Off unless an adjudicator model is configured; fires when stage-2
//! consensus is weak. The trigger reason strings are part of the trace
//! contract and must not be reworded.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anonymize::PublicAnswer;
use crate::consensus::ConsensusMetrics;
use crate::prompts;
use crate::types::Judgement;

/// Thresholds for the four triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationPolicy {
    pub min_top1_support: f64,
    pub min_evidence_ok_rate: f64,
    pub max_partial_rate: f64,
}

impl Default for AdjudicationPolicy {
    fn default() -> Self {
        Self {
            min_top1_support: 0.60,
            min_evidence_ok_rate: 0.75,
            max_partial_rate: 0.10,
        }
    }
}

impl AdjudicationPolicy {
    /// Whether adjudication fires, and the canonical reason string recorded
    /// in the trace. Checks run in a fixed order; the first hit wins.
    pub fn trigger(&self, metrics: &ConsensusMetrics) -> Option<String> {
        if metrics.non_partial == 0 {
            // Nothing to re-judge against; the orchestrator falls back to
            // the stage-1 order instead.
            return None;
        }

        let reason = if metrics.top1_support < self.min_top1_support {
            Some(format!("top1_support<{:.2}", self.min_top1_support))
        } else if metrics.evidence_ok_rate < self.min_evidence_ok_rate {
            Some(format!("evidence_ok_rate<{:.2}", self.min_evidence_ok_rate))
        } else if metrics.partial_rate > self.max_partial_rate {
            Some(format!("partial_rate>{:.2}", self.max_partial_rate))
        } else if metrics.divergence_extreme {
            Some("divergence_extreme".to_string())
        } else {
            None
        };

        if let Some(ref reason) = reason {
            info!(reason = %reason, "Adjudication triggered");
        }
        reason
    }

    /// The adjudicator's prompt: anonymized answers, panel rationales, and
    /// the rubric dimensions.
    pub fn prompt(
        &self,
        user_prompt: &str,
        answers: &[PublicAnswer],
        judgements: &[Judgement],
    ) -> String {
        prompts::adjudicator_prompt(user_prompt, answers, judgements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> ConsensusMetrics {
        ConsensusMetrics {
            top1_consensus: Some(crate::types::Label::at(0).unwrap()),
            top1_support: 1.0,
            aggregate_rankings: vec![],
            partial_rate: 0.0,
            evidence_ok_rate: 1.0,
            divergence_extreme: false,
            non_partial: 4,
        }
    }

    #[test]
    fn test_no_trigger_on_strong_consensus() {
        let policy = AdjudicationPolicy::default();
        assert_eq!(policy.trigger(&metrics()), None);
    }

    #[test]
    fn test_low_support_trigger_reason_string() {
        let policy = AdjudicationPolicy::default();
        let weak = ConsensusMetrics {
            top1_support: 0.5,
            ..metrics()
        };
        assert_eq!(policy.trigger(&weak).as_deref(), Some("top1_support<0.60"));
    }

    #[test]
    fn test_evidence_trigger() {
        let policy = AdjudicationPolicy::default();
        let weak = ConsensusMetrics {
            evidence_ok_rate: 0.5,
            ..metrics()
        };
        assert_eq!(
            policy.trigger(&weak).as_deref(),
            Some("evidence_ok_rate<0.75")
        );
    }

    #[test]
    fn test_partial_rate_trigger() {
        let policy = AdjudicationPolicy::default();
        let weak = ConsensusMetrics {
            partial_rate: 0.25,
            ..metrics()
        };
        assert_eq!(policy.trigger(&weak).as_deref(), Some("partial_rate>0.10"));
    }

    #[test]
    fn test_divergence_trigger() {
        let policy = AdjudicationPolicy::default();
        let weak = ConsensusMetrics {
            divergence_extreme: true,
            ..metrics()
        };
        assert_eq!(policy.trigger(&weak).as_deref(), Some("divergence_extreme"));
    }

    #[test]
    fn test_trigger_order_support_wins() {
        let policy = AdjudicationPolicy::default();
        let weak = ConsensusMetrics {
            top1_support: 0.5,
            evidence_ok_rate: 0.1,
            partial_rate: 0.9,
            divergence_extreme: true,
            ..metrics()
        };
        assert_eq!(policy.trigger(&weak).as_deref(), Some("top1_support<0.60"));
    }

    #[test]
    fn test_empty_panel_never_triggers() {
        let policy = AdjudicationPolicy::default();
        let empty = ConsensusMetrics {
            top1_consensus: None,
            top1_support: 0.0,
            partial_rate: 1.0,
            evidence_ok_rate: 0.0,
            non_partial: 0,
            ..metrics()
        };
        assert_eq!(policy.trigger(&empty), None);
    }
}
