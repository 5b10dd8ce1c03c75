//! Configuration loading (§10.4): a read-only, multi-format generalization
//! of the teacher's `io/config.rs` atomic-write TOML pattern.
//!
//! Precedence: `--config` path verbatim (format inferred from extension);
//! else `.orc/config.{json,yaml,yml}` in the repo; else
//! `{repo}/orc.config.{json,yaml,yml}`; else the compiled-in default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::model::agent_spec::{AgentFamily, AgentRole};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub orchestrator: OrchestratorConfig,
    pub telegram: TelegramConfig,
    pub testing: TestingConfig,
    pub agents: AgentsConfig,
    pub codex: FamilyDefaults,
    pub claude_code: FamilyDefaults,
    pub logging: LoggingConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            telegram: TelegramConfig::default(),
            testing: TestingConfig::default(),
            agents: AgentsConfig::default(),
            codex: FamilyDefaults::default(),
            claude_code: FamilyDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategyConfig {
    Auto,
    Worktree,
    Copy,
    InPlace,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    Always,
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirtyMainPolicy {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: Option<u32>,
    pub max_claude_question_rounds: u32,
    pub workspace_strategy: WorkspaceStrategyConfig,
    pub use_git_worktree: bool,
    pub cleanup: CleanupPolicy,
    pub apply_changes_on_success: bool,
    pub commit_on_approval: bool,
    pub commit_message: String,
    pub auto_merge_on_approval: bool,
    pub merge_target_branch: String,
    pub merge_style: String,
    pub dirty_main_policy: DirtyMainPolicy,
    pub dirty_main_commit_message: String,
    pub merge_commit_message: String,
    pub delete_branch_on_merge: bool,
    pub delete_worktree_on_merge: bool,
    pub carry_forward_workspace_between_iterations: bool,
    pub session_mode: bool,
    pub branch_prefix: String,
    pub branch_name_length: usize,
    pub branch_suffix_length: usize,
    pub ui: UiConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(10),
            max_claude_question_rounds: 3,
            workspace_strategy: WorkspaceStrategyConfig::Auto,
            use_git_worktree: true,
            cleanup: CleanupPolicy::OnSuccess,
            apply_changes_on_success: true,
            commit_on_approval: true,
            commit_message: "orc: {task} ({run_id})".to_string(),
            auto_merge_on_approval: false,
            merge_target_branch: "main".to_string(),
            merge_style: "merge_commit".to_string(),
            dirty_main_policy: DirtyMainPolicy::Abort,
            dirty_main_commit_message: "orc: snapshot dirty {merge_target_branch} before merge".to_string(),
            merge_commit_message: "orc: merge {branch} into {merge_target_branch} ({run_id})".to_string(),
            delete_branch_on_merge: false,
            delete_worktree_on_merge: true,
            carry_forward_workspace_between_iterations: false,
            session_mode: false,
            branch_prefix: "orc".to_string(),
            branch_name_length: 60,
            branch_suffix_length: 6,
            ui: UiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub poll_interval_sec: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_range_start: 8700,
            port_range_end: 8710,
            poll_interval_sec: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<i64>,
    pub allowed_user_ids: Vec<i64>,
    pub poll_interval_sec: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            chat_id: None,
            allowed_user_ids: Vec::new(),
            poll_interval_sec: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestingConfig {
    pub install_command: Vec<String>,
    pub unit_command: Vec<String>,
    pub e2e_command: Vec<String>,
    pub install_if_missing: bool,
    pub timeout_sec: Option<u64>,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            install_command: vec!["npm".to_string(), "install".to_string()],
            unit_command: vec!["npm".to_string(), "test".to_string()],
            e2e_command: vec!["npx".to_string(), "playwright".to_string(), "test".to_string()],
            install_if_missing: false,
            timeout_sec: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    RoundRobin,
    AllExecutorsPerPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssignmentConfig {
    pub mode: AssignmentMode,
    pub executors_per_plan: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            mode: AssignmentMode::RoundRobin,
            executors_per_plan: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub reviewers: Vec<AgentEntry>,
    pub executors: Vec<AgentEntry>,
    pub assignment: AssignmentConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            reviewers: vec![AgentEntry {
                id: "reviewer-1".to_string(),
                family: AgentFamily::A,
                command: None,
                model: None,
                reasoning_effort: None,
                verbosity: None,
                max_turns: None,
                allowed_tools: None,
                turn_budget: None,
            }],
            executors: vec![AgentEntry {
                id: "executor-1".to_string(),
                family: AgentFamily::B,
                command: None,
                model: None,
                reasoning_effort: None,
                verbosity: None,
                max_turns: None,
                allowed_tools: None,
                turn_budget: None,
            }],
            assignment: AssignmentConfig::default(),
        }
    }
}

/// Config-file shape for one agent; turned into a full `AgentSpec` by
/// attaching the fixed `role` implied by which roster it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentEntry {
    pub id: String,
    pub family: AgentFamily,
    pub command: Option<Vec<String>>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Option<Vec<String>>,
    pub turn_budget: Option<u32>,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            family: AgentFamily::A,
            command: None,
            model: None,
            reasoning_effort: None,
            verbosity: None,
            max_turns: None,
            allowed_tools: None,
            turn_budget: None,
        }
    }
}

impl AgentEntry {
    pub fn into_spec(self, role: AgentRole) -> crate::model::agent_spec::AgentSpec {
        crate::model::agent_spec::AgentSpec {
            id: self.id,
            family: self.family,
            role,
            command: self.command,
            model: self.model,
            reasoning_effort: self.reasoning_effort,
            verbosity: self.verbosity,
            max_turns: self.max_turns,
            allowed_tools: self.allowed_tools,
            turn_budget: self.turn_budget,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FamilyDefaults {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

impl Default for FamilyDefaults {
    fn default() -> Self {
        Self {
            model: None,
            reasoning_effort: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.orchestrator.max_iterations {
            bail!("orchestrator.max_iterations must be > 0 or null");
        }
        if self.orchestrator.max_claude_question_rounds == 0 {
            bail!("orchestrator.max_claude_question_rounds must be > 0");
        }
        if self.orchestrator.merge_style != "merge_commit" {
            bail!("orchestrator.merge_style only supports \"merge_commit\"");
        }
        if self.orchestrator.merge_target_branch.trim().is_empty() {
            bail!("orchestrator.merge_target_branch must be non-empty");
        }
        if self.agents.reviewers.is_empty() {
            bail!("agents.reviewers must not be empty");
        }
        if self.agents.executors.is_empty() {
            bail!("agents.executors must not be empty");
        }
        if self.telegram.enabled && self.telegram.bot_token.as_deref().unwrap_or("").trim().is_empty() {
            bail!("telegram.bot_token is required when telegram.enabled is true");
        }
        if self.telegram.enabled && self.telegram.chat_id.is_none() {
            bail!("telegram.chat_id is required when telegram.enabled is true");
        }
        Ok(())
    }
}

/// Resolve the config file path per the §6 precedence chain, without
/// reading or parsing it. Returns `None` when nothing on disk applies and
/// the compiled-in default should be used.
pub fn resolve_config_path(explicit: Option<&Path>, repo: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    for candidate in dot_orc_candidate_paths(&repo.join(".orc")).into_iter().chain(repo_root_candidate_paths(repo)) {
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn dot_orc_candidate_paths(dir: &Path) -> Vec<PathBuf> {
    vec![dir.join("config.json"), dir.join("config.yaml"), dir.join("config.yml")]
}

fn repo_root_candidate_paths(repo: &Path) -> Vec<PathBuf> {
    vec![
        repo.join("orc.config.json"),
        repo.join("orc.config.yaml"),
        repo.join("orc.config.yml"),
    ]
}

/// Load and validate configuration through the full precedence chain.
pub fn load_config(explicit: Option<&Path>, repo: &Path) -> Result<RunnerConfig> {
    let cfg = match resolve_config_path(explicit, repo) {
        Some(path) => load_from_file(&path)?,
        None => RunnerConfig::default(),
    };
    cfg.validate()?;
    Ok(cfg)
}

fn load_from_file(path: &Path) -> Result<RunnerConfig> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| anyhow!("config file {} has no extension to infer format from", path.display()))?;
    match ext {
        "json" => serde_json::from_str(&contents).with_context(|| format!("parse {} as JSON", path.display())),
        "yaml" | "yml" => serde_yaml::from_str(&contents).with_context(|| format!("parse {} as YAML", path.display())),
        "toml" => toml::from_str(&contents).with_context(|| format!("parse {} as TOML", path.display())),
        other => bail!("unsupported config extension .{other} for {}", path.display()),
    }
}
