//! Prompt assembly for the three stages.
//!
//! Role system prompts live in [`crate::roles`]; this module renders the
//! per-run user prompts: the anonymized answer blocks, the judge contract
//! for the run's exact label set, the adjudicator rubric, and the Chairman
//! synthesis brief. No model id ever appears in a judge-facing prompt.

use crate::anonymize::PublicAnswer;
use crate::consensus::ConsensusMetrics;
use crate::types::{Judgement, Label};

/// Rubric dimensions the adjudicator (and Chairman) reason over.
pub const RUBRIC_DIMENSIONS: [&str; 6] = [
    "correctness",
    "completeness",
    "actionability",
    "risk_safety",
    "clarity",
    "contract_compliance",
];

/// Sentinel judges must write verbatim for an answer with nothing to cite.
pub const PLACEHOLDER_LINE: &str = "Insufficient signal in text.";

fn answer_blocks(answers: &[PublicAnswer]) -> String {
    answers
        .iter()
        .map(|a| format!("{}:\n{}", a.label.display_name(), a.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn contract_lines(labels: &[Label]) -> String {
    let mut lines: Vec<String> = labels
        .iter()
        .map(|l| format!("{}: Strength: <s>; Flaw: <f>", l.display_name()))
        .collect();
    let chain = labels
        .iter()
        .map(Label::display_name)
        .collect::<Vec<_>>()
        .join(" > ");
    lines.push(format!("FINAL_RANKING: {chain}"));
    lines.join("\n")
}

/// Stage-2 judge prompt: the user's prompt, the strict output contract for
/// this run's labels, then the anonymized answers.
pub fn judge_prompt(user_prompt: &str, answers: &[PublicAnswer]) -> String {
    let labels: Vec<Label> = answers.iter().map(|a| a.label).collect();
    format!(
        "USER PROMPT:\n{user_prompt}\n\n\
         You are reviewing {count} anonymous answers to the prompt above.\n\
         Reply with EXACTLY {line_count} lines and nothing else, in this shape\n\
         (one critique line per response, in label order, then the ranking):\n\n\
         {contract}\n\n\
         Rules:\n\
         - Each Strength and Flaw must quote a literal detail from that response\n\
           (backticks or double quotes around the quoted fragment).\n\
         - If a response offers nothing concrete to cite, write exactly:\n\
           {placeholder}\n\
         - Rank every label exactly once, best to worst, separated by \" > \".\n\
           No ties.\n\n\
         ANONYMIZED RESPONSES:\n\n{blocks}",
        count = answers.len(),
        line_count = answers.len() + 1,
        contract = contract_lines(&labels),
        placeholder = PLACEHOLDER_LINE,
        blocks = answer_blocks(answers),
    )
}

/// Adjudicator prompt: everything the judges saw plus their rationales and
/// the rubric dimensions, under the same output contract.
pub fn adjudicator_prompt(
    user_prompt: &str,
    answers: &[PublicAnswer],
    judgements: &[Judgement],
) -> String {
    let labels: Vec<Label> = answers.iter().map(|a| a.label).collect();
    let rationales = judgements
        .iter()
        .enumerate()
        .filter(|(_, j)| !j.ranking_text.is_empty())
        .map(|(i, j)| format!("Judge {}:\n{}", i + 1, j.ranking_text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "USER PROMPT:\n{user_prompt}\n\n\
         The panel below disagreed. Re-rank the anonymous answers, weighing\n\
         each rubric dimension explicitly: {rubric}.\n\n\
         Reply with EXACTLY {line_count} lines in this shape:\n\n\
         {contract}\n\n\
         ANONYMIZED RESPONSES:\n\n{blocks}\n\n\
         PANEL RATIONALES:\n\n{rationales}",
        rubric = RUBRIC_DIMENSIONS.join(", "),
        line_count = answers.len() + 1,
        contract = contract_lines(&labels),
        blocks = answer_blocks(answers),
    )
}

/// Stage-3 Chairman prompt: anonymized answers, the consensus verdict, and
/// instructions to pick a base, merge, and reject explicitly.
pub fn chairman_prompt(
    user_prompt: &str,
    answers: &[PublicAnswer],
    base_label: Label,
    metrics: &ConsensusMetrics,
) -> String {
    let ranks = metrics
        .aggregate_rankings
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. average rank {:.2}", i + 1, r.average_rank))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You chair a review panel that has ranked several anonymous answers.\n\
         Panel consensus: {base} is the strongest base ({support:.0}% top-1 support).\n\
         Aggregate positions (best first):\n{ranks}\n\n\
         Write the single best final answer to the user's prompt:\n\
         - Start from the base answer.\n\
         - Fold in genuine improvements from the other answers, judged on:\n\
           {rubric}.\n\
         - Reject suggestions that are wrong or unsafe, and say why.\n\
         After the answer, append structured lines (these are stripped before\n\
         the user sees anything):\n\
         BASE: {base}\n\
         MERGED: Response X - <reason> (<dimension>)   (one per merged idea)\n\
         REJECTED: Response X - <point> - <reason>     (one per rejection)\n\n\
         USER PROMPT:\n{user_prompt}\n\n\
         ANONYMIZED ANSWERS:\n\n{blocks}",
        base = base_label.display_name(),
        support = metrics.top1_support * 100.0,
        rubric = RUBRIC_DIMENSIONS.join(", "),
        blocks = answer_blocks(answers),
    )
}

/// System prompt for the one-shot title call. Not a council role: title
/// generation is a utility pass outside the deliberation.
pub const TITLE_SYSTEM_PROMPT: &str =
    "You name conversations. Reply with a short plain-text title and nothing else.";

/// Best-effort title request; failure is swallowed by the caller.
pub fn title_prompt(user_prompt: &str) -> String {
    format!(
        "Write a conversation title for the message below: at most 8 words,\n\
         plain text, no quotes, no trailing punctuation. Reply with the title\n\
         only.\n\nMESSAGE:\n{user_prompt}"
    )
}
