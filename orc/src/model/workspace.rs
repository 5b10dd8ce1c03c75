use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    Auto,
    Worktree,
    Copy,
    InPlace,
}

/// Descriptor for an isolated working directory for a candidate (or the whole
/// run). The behavior (diff/apply/cleanup) lives in
/// [`crate::io::workspace_manager`]; this type is the durable, serializable
/// record of where things are.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub repo_path: PathBuf,
    pub path: PathBuf,
    pub strategy: WorkspaceStrategy,
    pub run_dir: PathBuf,
    pub baseline_path: Option<PathBuf>,
    pub branch_name: Option<String>,
}

impl Workspace {
    pub fn is_git_backed(&self) -> bool {
        matches!(self.strategy, WorkspaceStrategy::Worktree)
    }
}
