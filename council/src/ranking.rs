//! Stage-2 contract parser.
//!
//! Judges must return exactly one critique line per labelled answer plus a
//! single `FINAL_RANKING:` line. Real models wrap lines, concatenate
//! critiques, pad with prose, and drop labels; the parser repairs what it
//! can, flags what it repaired, and marks the judgement *partial* when the
//! ranking cannot be trusted. It never reorders a ranking on its own.
//!
//! ```text
//! Response A: Strength: <s>; Flaw: <f>
//! Response B: Strength: <s>; Flaw: <f>
//! ...
//! FINAL_RANKING: Response B > Response A > ...
//! ```

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{Judgement, Label, LabelCritique, PartialReason};

/// Case-insensitive sentinel a judge writes when an answer gave it nothing
/// concrete to cite.
pub const PLACEHOLDER_SENTINEL: &str = "insufficient signal in text";

/// More than this fraction of placeholder critiques marks the judge partial.
const PLACEHOLDER_LIMIT: f64 = 0.25;

/// Minimum length for an identifier-like evidence token.
const MIN_TOKEN_LEN: usize = 4;

const FINAL_MARKER: &str = "final_ranking:";

/// Parser for one run's label set. Pure and non-blocking.
pub struct RankingParser {
    labels: Vec<Label>,
}

impl RankingParser {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup();
        Self { labels }
    }

    /// Parse one judge's raw output into a [`Judgement`].
    ///
    /// `answers` maps each label to its stage-1 text, for the evidence rule.
    pub fn parse(
        &self,
        model_id: &str,
        raw_text: &str,
        answers: &BTreeMap<Label, String>,
    ) -> Judgement {
        let n = self.labels.len();
        let trimmed = raw_text.trim();
        if trimmed.is_empty() || n == 0 {
            let mut judgement = Judgement::failed(model_id, PartialReason::EmptyText);
            judgement.raw_text = raw_text.to_string();
            return judgement;
        }

        let lines: Vec<&str> = trimmed
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        // First failure detected in algorithm order wins.
        let mut partial_reason: Option<PartialReason> = None;
        fn note(slot: &mut Option<PartialReason>, reason: PartialReason) {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }

        // Line-count check: exactly one critique per label plus the ranking.
        let strict = lines.len() == n + 1
            && self
                .labels
                .iter()
                .zip(lines.iter())
                .all(|(label, line)| starts_with_label(line, *label))
            && lines[n].to_ascii_lowercase().starts_with(FINAL_MARKER);

        let (critique_lines, final_line, format_fix_used) = if strict {
            let critiques = self
                .labels
                .iter()
                .zip(lines.iter())
                .map(|(label, line)| (*label, normalize_ws(line)))
                .collect::<BTreeMap<_, _>>();
            (critiques, Some(normalize_ws(lines[n])), false)
        } else {
            let (critiques, final_line) = self.repair(&lines);
            (critiques, final_line, true)
        };

        if critique_lines.len() != n {
            debug!(
                model_id,
                recovered = critique_lines.len(),
                expected = n,
                "Judge critique block incomplete"
            );
            note(&mut partial_reason, PartialReason::LineCount);
        }

        // Per-label critiques, placeholder detection, evidence rule.
        let mut per_label_critiques = BTreeMap::new();
        let mut placeholders = 0usize;
        for label in &self.labels {
            let critique = match critique_lines.get(label) {
                Some(line) => {
                    let body = strip_label_prefix(line, *label);
                    if body.to_ascii_lowercase().contains(PLACEHOLDER_SENTINEL) {
                        placeholders += 1;
                    }
                    let (strength, flaw) = split_strength_flaw(&body);
                    let evidence_tokens = match answers.get(label) {
                        Some(answer) => verified_tokens(&body, answer),
                        None => Vec::new(),
                    };
                    LabelCritique {
                        strength,
                        flaw,
                        evidence_tokens,
                    }
                }
                None => LabelCritique::default(),
            };
            per_label_critiques.insert(*label, critique);
        }

        if placeholders as f64 / n as f64 > PLACEHOLDER_LIMIT {
            note(&mut partial_reason, PartialReason::Placeholder);
        }

        // FINAL_RANKING parse, with one coercion pass.
        let mut coerced = false;
        let parsed_ranking = match &final_line {
            None => {
                note(&mut partial_reason, PartialReason::RankingInvalid);
                Vec::new()
            }
            Some(line) => {
                let chain = line
                    .to_ascii_lowercase()
                    .rfind(FINAL_MARKER)
                    .map(|pos| line[pos + FINAL_MARKER.len()..].to_string())
                    .unwrap_or_else(|| line.clone());

                if chain.contains('=') {
                    // Ties are not part of the contract; refusing to impose
                    // an order keeps the parser from ever reordering.
                    note(&mut partial_reason, PartialReason::RankingInvalid);
                    Vec::new()
                } else {
                    let extracted = extract_label_chain(&chain);
                    let known: Vec<Label> = extracted
                        .iter()
                        .copied()
                        .filter(|l| self.labels.contains(l))
                        .collect();
                    let is_permutation =
                        known.len() == extracted.len() && known.len() == n;

                    if is_permutation {
                        known
                    } else if known.is_empty() {
                        note(&mut partial_reason, PartialReason::RankingInvalid);
                        Vec::new()
                    } else {
                        let mut completed = known;
                        for label in &self.labels {
                            if !completed.contains(label) {
                                completed.push(*label);
                            }
                        }
                        coerced = true;
                        completed
                    }
                }
            }
        };

        let ranking_text = self.render_block(&critique_lines, &final_line, &parsed_ranking, coerced);

        Judgement {
            model_id: model_id.to_string(),
            raw_text: raw_text.to_string(),
            ranking_text,
            parsed_ranking,
            per_label_critiques,
            partial: partial_reason.is_some(),
            partial_reason,
            format_fix_used,
            coerced,
            adjudicator: false,
        }
    }

    /// Format fix: recover critique segments and the ranking line from text
    /// whose line structure is broken (wrapped critiques, everything on one
    /// line, surrounding prose).
    fn repair(&self, lines: &[&str]) -> (BTreeMap<Label, String>, Option<String>) {
        let flat = lines.join("\n");
        let lower = flat.to_ascii_lowercase();

        let mut markers: Vec<(usize, Label)> = Vec::new();
        for (pos, _) in lower.match_indices("response ") {
            let rest = &lower[pos + "response ".len()..];
            let Some(c) = rest.chars().next() else { continue };
            let Some(label) = Label::from_letter(c) else { continue };
            if self.labels.contains(&label) && rest[c.len_utf8()..].starts_with(':') {
                markers.push((pos, label));
            }
        }

        let final_pos = lower.rfind(FINAL_MARKER);

        let mut boundaries: Vec<usize> = markers.iter().map(|(p, _)| *p).collect();
        if let Some(p) = final_pos {
            boundaries.push(p);
        }
        boundaries.push(flat.len());
        boundaries.sort_unstable();

        let mut critiques = BTreeMap::new();
        for (pos, label) in &markers {
            if critiques.contains_key(label) {
                continue;
            }
            let end = boundaries
                .iter()
                .copied()
                .find(|b| *b > *pos)
                .unwrap_or(flat.len());
            critiques.insert(*label, normalize_ws(&flat[*pos..end]));
        }

        // The ranking is the remainder of its own physical line; anything on
        // later lines is trailing prose and dropped.
        let final_line = final_pos.map(|pos| {
            let end = flat[pos..]
                .find('\n')
                .map(|off| pos + off)
                .unwrap_or(flat.len());
            normalize_ws(&flat[pos..end])
        });

        (critiques, final_line)
    }

    /// Rebuild the canonical block: recovered critique lines in label order,
    /// then the ranking line (rewritten only when the ranking was coerced).
    fn render_block(
        &self,
        critiques: &BTreeMap<Label, String>,
        final_line: &Option<String>,
        parsed_ranking: &[Label],
        coerced: bool,
    ) -> String {
        let mut out: Vec<String> = self
            .labels
            .iter()
            .filter_map(|label| critiques.get(label).cloned())
            .collect();

        if coerced && !parsed_ranking.is_empty() {
            let chain = parsed_ranking
                .iter()
                .map(Label::display_name)
                .collect::<Vec<_>>()
                .join(" > ");
            out.push(format!("FINAL_RANKING: {chain}"));
        } else if let Some(line) = final_line {
            out.push(line.clone());
        }

        out.join("\n")
    }
}

fn starts_with_label(line: &str, label: Label) -> bool {
    line.to_ascii_lowercase()
        .starts_with(&format!("response {}:", label.letter().to_ascii_lowercase()))
}

fn strip_label_prefix(line: &str, label: Label) -> String {
    let prefix = format!("response {}:", label.letter().to_ascii_lowercase());
    if line.to_ascii_lowercase().starts_with(&prefix) {
        line[prefix.len()..].trim().to_string()
    } else {
        line.trim().to_string()
    }
}

/// Pull `Strength:` and `Flaw:` substrings out of a critique body. Either
/// may be missing, in which case it is recorded as empty.
fn split_strength_flaw(body: &str) -> (String, String) {
    let lower = body.to_ascii_lowercase();
    let strength_pos = lower.find("strength:");
    let flaw_pos = lower.rfind("flaw:");

    let strength = match (strength_pos, flaw_pos) {
        (Some(s), Some(f)) if f > s => body[s + "strength:".len()..f].trim(),
        (Some(s), _) => body[s + "strength:".len()..].trim(),
        (None, _) => "",
    };
    let flaw = match flaw_pos {
        Some(f) => body[f + "flaw:".len()..].trim(),
        None => "",
    };

    (
        strength.trim_end_matches(';').trim().to_string(),
        flaw.trim_end_matches(';').trim().to_string(),
    )
}

/// Collapse all whitespace runs to single spaces.
fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Evidence tokenizer: backtick spans, double-quoted spans, and
/// identifier-like tokens of length >= 4, in order of appearance.
fn extract_evidence_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut push = |token: &str| {
        let token = normalize_ws(token);
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    };

    for delimiter in ['`', '"'] {
        let mut rest = text;
        while let Some(open) = rest.find(delimiter) {
            let after = &rest[open + 1..];
            match after.find(delimiter) {
                Some(close) => {
                    push(&after[..close]);
                    rest = &after[close + 1..];
                }
                None => break,
            }
        }
    }

    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c);
        } else {
            if identifier_like(&current) {
                push(&current);
            }
            current.clear();
        }
    }
    if identifier_like(&current) {
        push(&current);
    }

    tokens
}

fn identifier_like(token: &str) -> bool {
    token.len() >= MIN_TOKEN_LEN
        && token
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
}

/// Tokens from `critique` that actually occur in `answer` (case-sensitive,
/// after whitespace normalization). Empty means the critique fails the
/// evidence rule.
fn verified_tokens(critique: &str, answer: &str) -> Vec<String> {
    let haystack = normalize_ws(answer);
    extract_evidence_tokens(critique)
        .into_iter()
        .filter(|token| haystack.contains(token.as_str()))
        .collect()
}

/// Ordered, de-duplicated labels mentioned as `Response X` in a ranking
/// chain. Unknown letters are kept so the caller can tell a clean
/// permutation from one that needs coercion.
pub(crate) fn extract_label_chain(chain: &str) -> Vec<Label> {
    let lower = chain.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut out: Vec<Label> = Vec::new();

    for (pos, _) in lower.match_indices("response") {
        if pos > 0 && (bytes[pos - 1].is_ascii_alphanumeric() || bytes[pos - 1] == b'_') {
            continue;
        }
        let rest = &lower[pos + "response".len()..];
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }
        let rest = rest.trim_start();
        let Some(c) = rest.chars().next() else { continue };
        if !c.is_ascii_alphabetic() {
            continue;
        }
        // Single-letter word: "response ab" is not a label mention.
        if rest[c.len_utf8()..]
            .chars()
            .next()
            .map(|next| next.is_ascii_alphanumeric() || next == '_')
            .unwrap_or(false)
        {
            continue;
        }
        if let Some(label) = Label::from_letter(c) {
            if !out.contains(&label) {
                out.push(label);
            }
        }
    }

    out
}
