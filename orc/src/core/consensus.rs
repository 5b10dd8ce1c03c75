//! Exact-agreement consensus across reviewer decisions (Testable Property #4).

use crate::model::ReviewerDecision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusResult {
    pub consensus: bool,
    pub status: Option<String>,
    pub winner: Option<String>,
    pub next_prompt: Option<String>,
}

impl ConsensusResult {
    fn none() -> Self {
        Self {
            consensus: false,
            status: None,
            winner: None,
            next_prompt: None,
        }
    }
}

/// Reviewers reach consensus only when every decision agrees exactly on
/// `(status, winner, next_prompt)`. An empty decision list is never consensus.
pub fn consensus(decisions: &[ReviewerDecision]) -> ConsensusResult {
    let Some(first) = decisions.first() else {
        return ConsensusResult::none();
    };

    let key = |d: &ReviewerDecision| {
        (
            d.status_label(),
            d.winner_candidate_id().map(str::to_string),
            d.next_prompt().map(str::to_string),
        )
    };
    let first_key = key(first);
    let all_agree = decisions.iter().all(|d| key(d) == first_key);
    if !all_agree {
        return ConsensusResult::none();
    }

    ConsensusResult {
        consensus: true,
        status: Some(first_key.0.to_string()),
        winner: first_key.1,
        next_prompt: first_key.2,
    }
}
