//! Role table for the council.
//!
//! A closed set of `(name, system_prompt)` records, loaded at process start
//! and never derived from user input. Council seats rotate through the four
//! generation roles; Judge, Chairman, and Adjudicator are reserved for the
//! review and synthesis stages.

use serde::{Deserialize, Serialize};

/// Every role a model can hold in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Fastest correct implementation.
    Builder,
    /// Attacks assumptions and failure modes.
    Skeptic,
    /// Smallest diff, simplest steps.
    Minimalist,
    /// Security, abuse-resistance, operational risk.
    Auditor,
    /// Applies the 5-line critique contract and the evidence rule.
    Judge,
    /// Editor-in-chief: selects a base answer and merges improvements.
    Chairman,
    /// Re-judge with rubric-dimension reasoning, invoked on weak consensus.
    Adjudicator,
}

/// Generation roles assigned to council seats, in config-index order.
/// Councils larger than four cycle through the list again.
pub const COUNCIL_SEATS: [Role; 4] = [Role::Builder, Role::Skeptic, Role::Minimalist, Role::Auditor];

impl Role {
    /// Stable name used in traces and the `model_roles` map.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Builder => "Builder",
            Self::Skeptic => "Skeptic",
            Self::Minimalist => "Minimalist",
            Self::Auditor => "Auditor",
            Self::Judge => "Judge",
            Self::Chairman => "Chairman",
            Self::Adjudicator => "Adjudicator",
        }
    }

    /// Role for the council seat at `index`.
    pub fn for_seat(index: usize) -> Role {
        COUNCIL_SEATS[index % COUNCIL_SEATS.len()]
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Builder => {
                "You are the Builder on a model council. Produce the fastest correct \
                 answer to the user's problem: concrete steps, working detail, no \
                 hedging. If something is unknown, say so and give the next best step."
            }
            Self::Skeptic => {
                "You are the Skeptic on a model council. Pressure-test the problem: \
                 surface hidden assumptions, failure modes, and missing constraints \
                 before proposing a solution. Stay grounded; do not invent facts."
            }
            Self::Minimalist => {
                "You are the Minimalist on a model council. Propose the smallest change \
                 or simplest sequence of steps that solves the problem. Prefer removing \
                 complexity over adding it, and say what you deliberately left out."
            }
            Self::Auditor => {
                "You are the Auditor on a model council. Evaluate the problem for \
                 security exposure, abuse paths, and operational risk, and make your \
                 recommendation with those risks called out explicitly."
            }
            Self::Judge => {
                "You are a Judge reviewing anonymous answers from different models. \
                 Follow the output contract exactly: one critique line per response \
                 with a Strength and a Flaw, each grounded in a literal detail quoted \
                 from that response, then a single FINAL_RANKING line. If a response \
                 gives you nothing concrete to cite, write exactly: Insufficient \
                 signal in text. Never reveal or guess which model wrote an answer."
            }
            Self::Chairman => {
                "You are the Chairman of a model council. Synthesize the single best \
                 final answer for the user: choose a base response, fold in genuine \
                 improvements from the others, and reject bad suggestions explicitly. \
                 Do not mention the council or its internal stages."
            }
            Self::Adjudicator => {
                "You are the Adjudicator for a model council whose judges disagreed. \
                 Re-rank the anonymous answers using the rubric dimensions you are \
                 given, reasoning dimension by dimension. Follow the same output \
                 contract as the judges: one critique line per response, then a \
                 single FINAL_RANKING line. Cite literal details from the answers."
            }
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
