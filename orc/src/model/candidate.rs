use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCommandResult {
    pub id: String,
    pub kind: String,
    pub label: Option<String>,
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestResults {
    pub commands: Vec<TestCommandResult>,
    pub installed_deps: Option<TestCommandResult>,
}

impl TestResults {
    pub fn all_passed(&self) -> bool {
        self.commands.iter().all(|c| c.exit_code == 0)
    }

    pub fn one_line_summary(&self) -> String {
        if self.commands.is_empty() {
            return "no test commands ran".to_string();
        }
        let passed = self.commands.iter().filter(|c| c.exit_code == 0).count();
        format!("{passed}/{} test commands passed", self.commands.len())
    }
}

/// One attempt to realize one plan: a (reviewer-plan, executor) pairing and
/// its workspace + artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub iteration: u32,
    pub reviewer_id: String,
    pub executor_id: String,
    pub workspace_path: PathBuf,
    pub status: CandidateStatus,
    pub executor_summary: Option<String>,
    pub test_results: Option<TestResults>,
    pub diff: Option<String>,
    pub diff_preview: Option<String>,
}

impl Candidate {
    pub fn new(
        iteration: u32,
        reviewer_id: &str,
        executor_id: &str,
        k: u32,
        workspace_path: PathBuf,
    ) -> Self {
        Self {
            id: format!("iter{iteration}-{reviewer_id}-{executor_id}-{k}"),
            iteration,
            reviewer_id: reviewer_id.to_string(),
            executor_id: executor_id.to_string(),
            workspace_path,
            status: CandidateStatus::Pending,
            executor_summary: None,
            test_results: None,
            diff: None,
            diff_preview: None,
        }
    }

    /// First 40 lines of `diff`, per §3.
    pub fn compute_diff_preview(diff: &str) -> String {
        diff.lines().take(40).collect::<Vec<_>>().join("\n")
    }
}
