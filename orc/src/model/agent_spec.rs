use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which wire contract an agent CLI speaks.
///
/// Family A (e.g. `codex exec`) writes one structured JSON message to a file
/// named by `--output-last-message`. Family B (e.g. `claude`) streams NDJSON
/// events and is tailed line by line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFamily {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Reviewer,
    Executor,
}

/// Immutable descriptor for one configured agent, created at config load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSpec {
    pub id: String,
    pub family: AgentFamily,
    pub role: AgentRole,
    pub command: Option<Vec<String>>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Option<Vec<String>>,
    pub turn_budget: Option<u32>,
}

impl AgentSpec {
    /// Executors may write to their workspace; reviewers are read-only.
    pub fn allows_side_effects(&self) -> bool {
        matches!(self.role, AgentRole::Executor)
    }

    pub fn default_command(&self) -> Vec<String> {
        if let Some(cmd) = &self.command {
            return cmd.clone();
        }
        match self.family {
            AgentFamily::A => vec!["codex".to_string(), "exec".to_string()],
            AgentFamily::B => vec!["claude".to_string()],
        }
    }

    pub fn effective_max_turns(&self, default: u32) -> u32 {
        match self.max_turns {
            Some(n) if n > 0 => n,
            _ => default,
        }
    }
}

/// Where an agent call should run and what it may touch.
#[derive(Debug, Clone)]
pub struct AgentCallContext {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: std::time::Duration,
    pub output_limit_bytes: usize,
    pub stream_path: Option<PathBuf>,
    pub resume_session_id: Option<String>,
}
