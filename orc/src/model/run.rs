use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stages of the iteration controller's state machine, persisted in `Run.stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    PlanReady,
    Executing,
    TestsReady,
    Reviewing,
    ReviewReady,
    Merging,
    Complete,
    PersistenceFailed,
    Failed,
    AwaitingUserInput,
    AwaitingInitialTask,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QnaEntry {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEvent {
    pub timestamp: String,
    pub event: String,
}

/// One end-to-end orchestration session for a single user task.
///
/// The State Store file (`state.json`) is the authoritative record; this struct
/// is exactly what gets serialized there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub task: String,
    pub iteration: u32,
    pub stage: Stage,
    pub approved: bool,
    pub approved_by_admin: bool,
    pub persisted: bool,
    pub run_status: RunStatus,
    pub orchestrator_mode: OrchestratorMode,
    pub user_qna: Vec<QnaEntry>,
    pub telegram_update_offset: Option<i64>,
    pub merge_status: Option<String>,
    pub merge_commit_sha: Option<String>,
    pub merge_conflict_files: Vec<String>,
    pub merge_resolution_summary: Option<String>,
    pub merge_error: Option<String>,
    pub awaiting_user_input: bool,
    pub awaiting_initial_task: bool,
    pub awaiting_admin_decision: bool,
    /// Validation failures from this iteration's invalid plans (§7: "Record
    /// under `plan_errors` / `review_errors`"), one entry per reviewer.
    pub plan_errors: Vec<String>,
    /// Validation failures from this iteration's invalid reviewer decisions.
    pub review_errors: Vec<String>,
    /// Reviewer-produced handoff summaries for the winning candidate, joined
    /// across reviewers; set once per approved iteration.
    pub handoff_summary: Option<String>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, repo_path: PathBuf, task: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            repo_path,
            task: task.into(),
            iteration: 1,
            stage: Stage::Idle,
            approved: false,
            approved_by_admin: false,
            persisted: false,
            run_status: RunStatus::Running,
            orchestrator_mode: OrchestratorMode::Multi,
            user_qna: Vec::new(),
            telegram_update_offset: None,
            merge_status: None,
            merge_commit_sha: None,
            merge_conflict_files: Vec::new(),
            merge_resolution_summary: None,
            merge_error: None,
            awaiting_user_input: false,
            awaiting_initial_task: false,
            awaiting_admin_decision: false,
            plan_errors: Vec::new(),
            review_errors: Vec::new(),
            handoff_summary: None,
        }
    }
}
