//! Iteration Controller (§4.6) and Resume Engine (§4.8).
//!
//! No direct teacher analog — the teacher drives a single codex call per run,
//! not a plan→execute→review→consensus loop across a reviewer/executor
//! roster. `Controller` wires together every `io::` component this pipeline
//! needs; `iteration.rs` holds the per-iteration algorithm and `resume.rs`
//! the crash-resume scan, following SPEC_FULL §4.6/§4.8's step lists
//! directly. Fan-out follows §5: one joined `thread::spawn` per participant,
//! the same shape as `io::process`'s dual-reader-thread pattern generalized
//! from two readers to N agents.

pub mod iteration;
pub mod resume;

pub use iteration::RunOutcome;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::config::RunnerConfig;
use crate::io::agent_client::AgentClient;
use crate::io::broker::{Broker, TelegramChannel};
use crate::io::prompt::PromptBuilder;
use crate::io::run_state::RunStateStore;
use crate::io::testing::{TestRunConfig, TestRunner};
use crate::io::workspace_manager::WorkspaceManager;
use crate::model::agent_spec::AgentCallContext;
use crate::model::AgentSpec;

const AGENT_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct Controller<'a> {
    pub config: &'a RunnerConfig,
    pub repo: PathBuf,
    pub run_dir: PathBuf,
    pub run_state: RunStateStore,
    pub workspaces: WorkspaceManager,
    pub agent_client: &'a (dyn AgentClient + Sync),
    pub test_runner: &'a (dyn TestRunner + Sync),
    pub prompts: PromptBuilder,
    pub broker: Broker,
    pub telegram: Mutex<Option<Box<dyn TelegramChannel + Send>>>,
    pub reviewers: Vec<AgentSpec>,
    pub executors: Vec<AgentSpec>,
    pub plan_schema: PathBuf,
    pub decision_schema: PathBuf,
    pub executor_output_schema: PathBuf,
    pub text_response_schema: PathBuf,
    pub agent_timeout: Duration,
}

impl<'a> Controller<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a RunnerConfig,
        repo: PathBuf,
        run_dir: PathBuf,
        run_state: RunStateStore,
        workspaces: WorkspaceManager,
        agent_client: &'a (dyn AgentClient + Sync),
        test_runner: &'a (dyn TestRunner + Sync),
        prompts: PromptBuilder,
        broker: Broker,
        telegram: Option<Box<dyn TelegramChannel + Send>>,
        reviewers: Vec<AgentSpec>,
        executors: Vec<AgentSpec>,
        plan_schema: PathBuf,
        decision_schema: PathBuf,
        executor_output_schema: PathBuf,
        text_response_schema: PathBuf,
    ) -> Self {
        Self {
            config,
            repo,
            run_dir,
            run_state,
            workspaces,
            agent_client,
            test_runner,
            prompts,
            broker,
            telegram: Mutex::new(telegram),
            reviewers,
            executors,
            plan_schema,
            decision_schema,
            executor_output_schema,
            text_response_schema,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub(crate) fn call_ctx(&self, workdir: &Path, log_name: &str) -> AgentCallContext {
        AgentCallContext {
            workdir: workdir.to_path_buf(),
            log_path: self.run_dir.join(format!("{log_name}.log")),
            timeout: self.agent_timeout,
            output_limit_bytes: AGENT_OUTPUT_LIMIT_BYTES,
            stream_path: None,
            resume_session_id: None,
        }
    }

    pub(crate) fn test_run_config(&self) -> TestRunConfig {
        let t = &self.config.testing;
        TestRunConfig {
            install_if_missing: t.install_if_missing,
            install_command: t.install_command.clone(),
            fallback_unit_command: t.unit_command.clone(),
            fallback_e2e_command: t.e2e_command.clone(),
            timeout_sec: t.timeout_sec,
        }
    }

    /// Every broker round waits forever for a human; `None` means no timeout.
    pub(crate) fn broker_timeout(&self) -> Option<Duration> {
        None
    }

    /// Runs `f` with the Telegram channel (if configured), then copies its
    /// post-call `offset()` into `Run.telegram_update_offset` so a resumed
    /// run picks up `getUpdates` polling where this one left off.
    pub(crate) fn with_telegram<T>(&self, f: impl FnOnce(Option<&mut dyn TelegramChannel>) -> T) -> T {
        let mut guard = self.telegram.lock().expect("telegram lock poisoned");
        let result = f(guard.as_deref_mut());
        if let Some(channel) = guard.as_deref() {
            let offset = channel.offset();
            if offset.is_some()
                && let Err(e) = self.run_state.update(|r| r.telegram_update_offset = offset)
            {
                warn!(err = %e, "failed to persist telegram update offset");
            }
        }
        result
    }

    /// Best-effort Telegram notification (admin requests, handoff summaries,
    /// max-iteration summaries per §6's Telegram protocol); failures are
    /// logged, never propagated, since the file-based broker always works.
    pub(crate) fn notify_telegram(&self, text: &str) {
        self.with_telegram(|tg| {
            if let Some(channel) = tg
                && let Err(e) = channel.notify(text)
            {
                warn!(err = %e, "telegram notification failed");
            }
        });
    }
}

/// Run `f` once per item on its own joined thread (§5 Concurrency Model): a
/// barrier at the end of every plan/execute/review fan-out.
pub(crate) fn fan_out<I, T, F>(items: &[I], f: F) -> Vec<Result<T>>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> Result<T> + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = items.iter().map(|item| scope.spawn(|| f(item))).collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result,
                Err(_) => {
                    warn!("fan-out worker thread panicked");
                    Err(anyhow::anyhow!("fan-out worker thread panicked"))
                }
            })
            .collect()
    })
}
