//! Test-only helpers: deterministic builders plus scripted test doubles for
//! [`crate::io::agent_client::AgentClient`] and
//! [`crate::io::testing::TestRunner`].
//!
//! Grounded on the teacher's `test_support.rs` (builder functions for
//! model structs) and `runner/tests/harness_lifecycle.rs`'s `Scripted*`
//! naming, generalized from the teacher's single-executor-trait harness to
//! this crate's reviewer/executor roster and test-runner seams.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::io::agent_client::{AgentCallOutcome, AgentClient};
use crate::io::testing::{TestRunConfig, TestRunner};
use crate::model::agent_spec::{AgentCallContext, AgentSpec};
use crate::model::candidate::{TestCommandResult, TestResults};
use crate::model::plan::TestCommandSpec;
use crate::model::workspace::{Workspace, WorkspaceStrategy};

/// Build a [`Workspace`] rooted at `path` with the [`WorkspaceStrategy::Copy`]
/// strategy, the simplest case every controller test can use without a real
/// git repo.
pub fn copy_workspace(repo_path: &Path, path: &Path, run_dir: &Path) -> Workspace {
    Workspace {
        repo_path: repo_path.to_path_buf(),
        path: path.to_path_buf(),
        strategy: WorkspaceStrategy::Copy,
        run_dir: run_dir.to_path_buf(),
        baseline_path: Some(run_dir.join("baseline")),
        branch_name: None,
    }
}

/// Build a minimal reviewer or executor [`AgentSpec`] with deterministic
/// command/model fields, suitable for tests that don't care about dispatch
/// details.
pub fn agent_spec(id: &str, role: crate::model::agent_spec::AgentRole) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        family: crate::model::agent_spec::AgentFamily::A,
        role,
        command: None,
        model: None,
        reasoning_effort: None,
        verbosity: None,
        max_turns: None,
        allowed_tools: None,
        turn_budget: None,
    }
}

/// One scripted response for [`ScriptedAgentClient`]: a JSON payload an
/// agent "produced" (optionally writing a file into the call's `workdir`
/// first, standing in for the real side effect a process-backed executor
/// would have), or an error to return instead of calling out.
pub enum ScriptedAgentResponse {
    Json(Value),
    /// Write `contents` to `workdir.join(relative_path)` before returning
    /// `payload`, simulating an executor editing the workspace.
    JsonWithWrite {
        payload: Value,
        relative_path: String,
        contents: String,
    },
    Err(String),
}

/// An [`AgentClient`] that returns pre-scripted responses in call order,
/// recording every invocation for assertions. Mirrors the teacher's
/// `ScriptedExecutor` (`runner/tests/harness_lifecycle.rs`): tests push the
/// exact sequence of outputs they want and drive the controller through it
/// without spawning a process.
pub struct ScriptedAgentClient {
    responses: Mutex<Vec<ScriptedAgentResponse>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

/// A recorded invocation of [`ScriptedAgentClient::call`].
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub agent_id: String,
    pub phase: String,
    pub prompt: String,
}

impl ScriptedAgentClient {
    /// Responses are consumed front-to-back, one per `call()`.
    pub fn new(responses: Vec<ScriptedAgentResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

impl AgentClient for ScriptedAgentClient {
    fn call(
        &self,
        spec: &AgentSpec,
        ctx: &AgentCallContext,
        prompt: &str,
        _schema_path: &Path,
        phase: &str,
    ) -> Result<AgentCallOutcome> {
        self.calls.lock().expect("calls lock poisoned").push(ScriptedCall {
            agent_id: spec.id.clone(),
            phase: phase.to_string(),
            prompt: prompt.to_string(),
        });
        let mut responses = self.responses.lock().expect("responses lock poisoned");
        if responses.is_empty() {
            bail!("ScriptedAgentClient: no more scripted responses for {}", spec.id);
        }
        match responses.remove(0) {
            ScriptedAgentResponse::Json(payload) => Ok(AgentCallOutcome {
                raw_text: payload.to_string(),
                payload,
                exit_code: 0,
            }),
            ScriptedAgentResponse::JsonWithWrite { payload, relative_path, contents } => {
                let dest = ctx.workdir.join(&relative_path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &contents)?;
                Ok(AgentCallOutcome {
                    raw_text: payload.to_string(),
                    payload,
                    exit_code: 0,
                })
            }
            ScriptedAgentResponse::Err(message) => bail!(message),
        }
    }
}

/// A [`TestRunner`] that always returns the same canned [`TestResults`],
/// regardless of `cwd` or the requested commands. Use
/// [`ScriptedTestRunner::passing`]/[`failing`] for the common cases.
pub struct ScriptedTestRunner {
    results: TestResults,
}

impl ScriptedTestRunner {
    pub fn new(results: TestResults) -> Self {
        Self { results }
    }

    pub fn passing() -> Self {
        Self::new(TestResults {
            commands: vec![one_result("unit", 0)],
            installed_deps: None,
        })
    }

    pub fn failing() -> Self {
        Self::new(TestResults {
            commands: vec![one_result("unit", 1)],
            installed_deps: None,
        })
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run_tests(
        &self,
        _cwd: &Path,
        _config: &TestRunConfig,
        _test_commands: Option<&[TestCommandSpec]>,
    ) -> Result<TestResults> {
        Ok(self.results.clone())
    }
}

fn one_result(id: &str, exit_code: i32) -> TestCommandResult {
    TestCommandResult {
        id: id.to_string(),
        kind: "unit".to_string(),
        label: None,
        command: vec!["true".to_string()],
        exit_code,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 0,
        timed_out: false,
    }
}

/// A throwaway git repo under a `tempfile::TempDir`, with one commit on
/// `main`, for tests exercising [`crate::io::workspace_manager::WorkspaceManager`]'s
/// worktree strategy. Grounded on the teacher's `TestRepo` fixture
/// (`runner/tests/harness_lifecycle.rs`).
pub struct TestRepo {
    pub dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn init() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        run_git(dir.path(), &["init", "-q", "-b", "main"])?;
        run_git(dir.path(), &["config", "user.email", "orc-test@example.com"])?;
        run_git(dir.path(), &["config", "user.name", "orc-test"])?;
        std::fs::write(dir.path().join("README.md"), "test repo\n")?;
        run_git(dir.path(), &["add", "."])?;
        run_git(dir.path(), &["commit", "-q", "-m", "initial commit"])?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<()> {
    let status = std::process::Command::new("git").args(args).current_dir(cwd).status()?;
    if !status.success() {
        bail!("git {:?} failed in {}", args, cwd.display());
    }
    Ok(())
}
