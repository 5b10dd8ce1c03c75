use serde::{Deserialize, Serialize};

/// A reviewer's verdict on a set of candidates for one iteration.
///
/// `Approved.next_prompt` is intentionally absent from the struct (not merely
/// `None`) — the approval guardrail (Testable Property #5) is enforced by the
/// type itself: there is no field to set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum ReviewerDecision {
    #[serde(rename = "APPROVED")]
    Approved {
        winner_candidate_id: String,
        summary: String,
        feedback: String,
    },
    #[serde(rename = "REJECTED")]
    Rejected {
        winner_candidate_id: String,
        summary: String,
        feedback: String,
        next_prompt: String,
    },
    #[serde(rename = "NEEDS_USER_INPUT")]
    NeedsUserInput { questions: Vec<String> },
}

impl ReviewerDecision {
    pub fn winner_candidate_id(&self) -> Option<&str> {
        match self {
            ReviewerDecision::Approved {
                winner_candidate_id,
                ..
            }
            | ReviewerDecision::Rejected {
                winner_candidate_id,
                ..
            } => Some(winner_candidate_id),
            ReviewerDecision::NeedsUserInput { .. } => None,
        }
    }

    pub fn next_prompt(&self) -> Option<&str> {
        match self {
            ReviewerDecision::Rejected { next_prompt, .. } => Some(next_prompt),
            _ => None,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            ReviewerDecision::Approved { .. } => "APPROVED",
            ReviewerDecision::Rejected { .. } => "REJECTED",
            ReviewerDecision::NeedsUserInput { .. } => "NEEDS_USER_INPUT",
        }
    }
}
