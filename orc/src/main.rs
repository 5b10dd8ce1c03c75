//! CLI entrypoint (§6, §10.5): wires configuration, persisted run state, and
//! every `io::` component into a [`Controller`] and drives one orchestration
//! run to completion.
//!
//! Follows the teacher's `runner/src/main.rs` shape: a thin `fn main` that
//! prints any top-level error and maps it to a process exit code, with all
//! real work in `try_main()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use orc::config::{self, RunnerConfig};
use orc::controller::resume;
use orc::controller::{Controller, RunOutcome};
use orc::exit_codes;
use orc::io::agent_client::ProcessAgentClient;
use orc::io::broker::{Broker, TelegramChannel};
use orc::io::prompt::PromptBuilder;
use orc::io::run_state::RunStateStore;
use orc::io::telegram::TelegramClient;
use orc::io::testing::ProcessTestRunner;
use orc::io::workspace_manager::WorkspaceManager;
use orc::model::agent_spec::AgentRole;
use orc::model::run::Run;
use orc::model::AgentSpec;

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");
const DECISION_SCHEMA: &str = include_str!("../schemas/decision.schema.json");
const EXECUTOR_OUTPUT_SCHEMA: &str = include_str!("../schemas/executor_output.schema.json");
const TEXT_RESPONSE_SCHEMA: &str = include_str!("../schemas/text_response.schema.json");

const PROMPT_BUDGET_BYTES: usize = 24 * 1024;
const BROKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "orc", version, about = "Multi-agent coding-task orchestrator")]
struct Cli {
    /// Task prompt, or a repo path/`.` to open the dashboard without a task.
    task_or_repo: Option<String>,

    /// Repo to operate on (defaults to the current directory).
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Resume a prior run by id instead of starting a new one.
    #[arg(long)]
    resume_run_id: Option<String>,

    /// Explicit config file path (overrides the repo-relative precedence chain).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    std::process::exit(match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INIT_ERROR
        }
    });
}

fn try_main() -> Result<i32> {
    orc::logging::init();
    let cli = Cli::parse();

    if cli.resume_run_id.is_some() && cli.task_or_repo.is_some() {
        bail!("--resume-run-id and an explicit task prompt are mutually exclusive");
    }

    let (repo, task) = resolve_repo_and_task(&cli);
    let repo = repo.canonicalize().with_context(|| format!("resolve repo path {}", repo.display()))?;

    let cfg = config::load_config(cli.config.as_deref(), &repo).context("load config")?;
    let logs_root = repo.join(".orc").join("logs");

    let (run_dir, run_state) = match &cli.resume_run_id {
        Some(id) => {
            let run_dir = resume::resolve_resume_target(&logs_root, id, &repo).context("resolve --resume-run-id")?;
            let store = RunStateStore::load(&run_dir).context("load resumed run state")?;
            (run_dir, store)
        }
        None if task.is_none() => match resume::find_resumable_run(&logs_root, &repo)? {
            Some(run_dir) => {
                let store = RunStateStore::load(&run_dir).context("load resumable run state")?;
                (run_dir, store)
            }
            None => new_run(&logs_root, &repo, None)?,
        },
        None => new_run(&logs_root, &repo, task.clone())?,
    };

    let mut outcome = run_once(&cfg, &repo, &run_dir, run_state, task)?;
    report_outcome(&outcome);

    // session_mode keeps the process alive across runs: once one run
    // completes, start a fresh one with no task (blocking on the broker for
    // the next prompt) rather than exiting. Stops at the first failure.
    while cfg.orchestrator.session_mode && !matches!(outcome, RunOutcome::Failed(_)) {
        let (run_dir, run_state) = new_run(&logs_root, &repo, None)?;
        outcome = run_once(&cfg, &repo, &run_dir, run_state, None)?;
        report_outcome(&outcome);
    }

    Ok(match outcome {
        RunOutcome::Approved => exit_codes::OK,
        RunOutcome::Failed(_) => exit_codes::RUN_FAILED,
    })
}

fn new_run(logs_root: &Path, repo: &Path, task: Option<String>) -> Result<(PathBuf, RunStateStore)> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let run_dir = logs_root.join(&run_id);
    let run = Run::new(run_id, repo.to_path_buf(), task.unwrap_or_default());
    let store = RunStateStore::create(&run_dir, run).context("create run state")?;
    Ok((run_dir, store))
}

/// Interpret the positional argument per §6: an existing directory (or `.`)
/// is the repo with no inferred task; otherwise it is the task prompt and
/// the repo defaults to the current directory.
fn resolve_repo_and_task(cli: &Cli) -> (PathBuf, Option<String>) {
    if let Some(repo) = &cli.repo {
        return (repo.clone(), cli.task_or_repo.clone());
    }
    match &cli.task_or_repo {
        Some(text) if text == "." || Path::new(text).is_dir() => (PathBuf::from(text), None),
        Some(text) => (PathBuf::from("."), Some(text.clone())),
        None => (PathBuf::from("."), None),
    }
}

fn run_once(
    cfg: &RunnerConfig,
    repo: &Path,
    run_dir: &Path,
    run_state: RunStateStore,
    initial_task: Option<String>,
) -> Result<RunOutcome> {
    let workspaces = WorkspaceManager::new(repo.join(".orc").join("workspaces")).context("init workspace manager")?;
    let agent_client = ProcessAgentClient::default();
    let test_runner = ProcessTestRunner;
    let prompts = PromptBuilder::new(PROMPT_BUDGET_BYTES);
    let broker = Broker::new(run_dir, BROKER_POLL_INTERVAL);

    let telegram_offset = run_state.get().telegram_update_offset;
    let telegram: Option<Box<dyn TelegramChannel + Send>> = if cfg.telegram.enabled {
        let bot_token = cfg.telegram.bot_token.clone().unwrap_or_default();
        let chat_id = cfg.telegram.chat_id.map(|id| id.to_string()).unwrap_or_default();
        let client = TelegramClient::new(bot_token, chat_id, cfg.telegram.allowed_user_ids.clone())
            .with_offset(telegram_offset);
        Some(Box::new(client))
    } else {
        None
    };

    let reviewers: Vec<AgentSpec> = cfg
        .agents
        .reviewers
        .iter()
        .cloned()
        .map(|entry| entry.into_spec(AgentRole::Reviewer))
        .collect();
    let executors: Vec<AgentSpec> = cfg
        .agents
        .executors
        .iter()
        .cloned()
        .map(|entry| entry.into_spec(AgentRole::Executor))
        .collect();

    let schema_dir = run_dir.join("schemas");
    std::fs::create_dir_all(&schema_dir).with_context(|| format!("create {}", schema_dir.display()))?;
    let plan_schema = write_schema(&schema_dir, "plan.schema.json", PLAN_SCHEMA)?;
    let decision_schema = write_schema(&schema_dir, "decision.schema.json", DECISION_SCHEMA)?;
    let executor_output_schema = write_schema(&schema_dir, "executor_output.schema.json", EXECUTOR_OUTPUT_SCHEMA)?;
    let text_response_schema = write_schema(&schema_dir, "text_response.schema.json", TEXT_RESPONSE_SCHEMA)?;

    let controller = Controller::new(
        cfg,
        repo.to_path_buf(),
        run_dir.to_path_buf(),
        run_state,
        workspaces,
        &agent_client,
        &test_runner,
        prompts,
        broker,
        telegram,
        reviewers,
        executors,
        plan_schema,
        decision_schema,
        executor_output_schema,
        text_response_schema,
    );

    controller.run(initial_task)
}

fn write_schema(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn report_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Approved => println!("run approved"),
        RunOutcome::Failed(reason) => println!("run failed: {reason}"),
    }
}
