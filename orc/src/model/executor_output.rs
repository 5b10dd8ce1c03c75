use serde::{Deserialize, Serialize};

/// Raw status string an executor CLI may emit, before back-compat normalization.
///
/// `NEEDS_CODEX` is a legacy alias for `NEEDS_REVIEWER` and must be treated
/// identically (§9 back-compat quirks).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RawStatus {
    Done,
    Failed,
    NeedsReviewer,
    NeedsCodex,
}

#[derive(Debug, Clone, Deserialize)]
struct RawExecutorOutput {
    status: RawStatus,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    questions: Option<Vec<String>>,
}

/// Normalized executor output, after the `NEEDS_CODEX` alias has been folded
/// into `NeedsReviewer` and a missing structured payload has been synthesized
/// into `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorOutput {
    Done { summary: String },
    Failed { summary: String },
    NeedsReviewer { questions: Vec<String> },
}

impl ExecutorOutput {
    pub fn summary(&self) -> &str {
        match self {
            ExecutorOutput::Done { summary } | ExecutorOutput::Failed { summary } => summary,
            ExecutorOutput::NeedsReviewer { .. } => "",
        }
    }

    /// Parse a structured payload, unwrapping an optional `structured_output`
    /// envelope and synthesizing `Done` from unstructured raw text (§9).
    pub fn from_payload(value: &serde_json::Value, raw_fallback: &str) -> Self {
        let unwrapped = value.get("structured_output").unwrap_or(value);
        match serde_json::from_value::<RawExecutorOutput>(unwrapped.clone()) {
            Ok(raw) => match raw.status {
                RawStatus::Done => ExecutorOutput::Done {
                    summary: raw.summary.unwrap_or_default(),
                },
                RawStatus::Failed => ExecutorOutput::Failed {
                    summary: raw.summary.unwrap_or_default(),
                },
                RawStatus::NeedsReviewer | RawStatus::NeedsCodex => ExecutorOutput::NeedsReviewer {
                    questions: raw.questions.unwrap_or_default(),
                },
            },
            Err(_) => ExecutorOutput::Done {
                summary: raw_fallback.to_string(),
            },
        }
    }
}
