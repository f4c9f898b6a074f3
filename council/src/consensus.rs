//! Consensus scoring over stage-2 judgements.
//!
//! Partial judges are excluded from everything except `partial_rate` and
//! `evidence_ok_rate`; an all-partial panel leaves consensus undefined and
//! the orchestrator falls back to the raw stage-1 order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::anonymize::LabelMap;
use crate::types::{AggregateRanking, Judgement, Label};

/// Aggregated stage-2 metrics. These drive the adjudication triggers and are
/// copied into the decision trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    /// Modal top-1 label across non-partial judges; ties break to the
    /// lexicographically smallest label. None when every judge was partial.
    pub top1_consensus: Option<Label>,
    /// Fraction of non-partial judges whose top-1 matches the winner.
    pub top1_support: f64,
    /// Mean rank per model, ascending (lower is better).
    pub aggregate_rankings: Vec<AggregateRanking>,
    /// Partial judges over all judges.
    pub partial_rate: f64,
    /// Mean per-judge evidence-ok ratio, over all judges.
    pub evidence_ok_rate: f64,
    /// True when no two non-partial judges share a top-1 pick.
    pub divergence_extreme: bool,
    /// Size of the non-partial panel.
    pub non_partial: usize,
}

/// Pure scorer; all inputs arrive by reference, nothing blocks.
pub struct ConsensusScorer;

impl ConsensusScorer {
    pub fn score(judgements: &[Judgement], label_map: &LabelMap) -> ConsensusMetrics {
        let total = judgements.len();
        let label_count = label_map.len();
        let non_partial: Vec<&Judgement> = judgements.iter().filter(|j| !j.partial).collect();

        let partial_rate = if total == 0 {
            0.0
        } else {
            (total - non_partial.len()) as f64 / total as f64
        };

        let evidence_ok_rate = if total == 0 {
            0.0
        } else {
            judgements
                .iter()
                .map(|j| j.evidence_ok_ratio(label_count))
                .sum::<f64>()
                / total as f64
        };

        let mut top1_counts: BTreeMap<Label, usize> = BTreeMap::new();
        for judgement in &non_partial {
            if let Some(top) = judgement.parsed_ranking.first() {
                *top1_counts.entry(*top).or_insert(0) += 1;
            }
        }

        // BTreeMap iteration is label-ordered, so a strict `>` comparison
        // leaves ties with the lexicographically smallest label.
        let top1 = top1_counts
            .iter()
            .fold(None::<(Label, usize)>, |best, (label, count)| match best {
                Some((_, best_count)) if *count <= best_count => best,
                _ => Some((*label, *count)),
            });

        let (top1_consensus, top1_support) = match top1 {
            Some((label, count)) if !non_partial.is_empty() => {
                (Some(label), count as f64 / non_partial.len() as f64)
            }
            _ => (None, 0.0),
        };

        let divergence_extreme = non_partial.len() >= 2
            && top1_counts.values().all(|count| *count == 1);

        ConsensusMetrics {
            top1_consensus,
            top1_support,
            aggregate_rankings: aggregate_rankings(&non_partial, label_map),
            partial_rate,
            evidence_ok_rate,
            divergence_extreme,
            non_partial: non_partial.len(),
        }
    }
}

/// Mean 1-based rank position per model over the non-partial panel, sorted
/// best first.
fn aggregate_rankings(non_partial: &[&Judgement], label_map: &LabelMap) -> Vec<AggregateRanking> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();

    for judgement in non_partial {
        for (position, label) in judgement.parsed_ranking.iter().enumerate() {
            let Some(model) = label_map.model_of(*label) else { continue };
            let entry = sums.entry(model.to_string()).or_insert((0.0, 0));
            entry.0 += (position + 1) as f64;
            entry.1 += 1;
        }
    }

    let mut out: Vec<AggregateRanking> = sums
        .into_iter()
        .map(|(model, (sum, count))| AggregateRanking {
            model,
            average_rank: sum / count as f64,
            rankings_count: count,
        })
        .collect();

    out.sort_by(|a, b| {
        a.average_rank
            .partial_cmp(&b.average_rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.model.cmp(&b.model))
    });
    out
}
