//! Black-box Test Runner (§4.6 point 3): runs a candidate's test commands and
//! reports structured pass/fail results.
//!
//! Generalizes the teacher's `io::guards::{GuardRunner, GuardRequest}` trait
//! shape onto `original_source/test_runner.py`'s exact semantics: optional
//! dependency install, plan-supplied commands preferred over config
//! fallbacks, and exit-124 synthesis (never panics) on a per-command timeout.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::io::process::run_with_timeout;
use crate::model::candidate::{TestCommandResult, TestResults};
use crate::model::plan::TestCommandSpec;

const OUTPUT_LIMIT_BYTES: usize = 2 * 1024 * 1024;
/// Used in place of Python's `timeout=None` (truly unbounded); still finite
/// so the subprocess layer's kill-on-expiry path stays in play.
const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct TestRunConfig {
    pub install_if_missing: bool,
    pub install_command: Vec<String>,
    pub fallback_unit_command: Vec<String>,
    pub fallback_e2e_command: Vec<String>,
    pub timeout_sec: Option<u64>,
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            install_if_missing: false,
            install_command: vec!["npm".to_string(), "install".to_string()],
            fallback_unit_command: vec!["npm".to_string(), "test".to_string()],
            fallback_e2e_command: vec!["npx".to_string(), "playwright".to_string(), "test".to_string()],
            timeout_sec: None,
        }
    }
}

pub trait TestRunner {
    fn run_tests(
        &self,
        cwd: &Path,
        config: &TestRunConfig,
        test_commands: Option<&[TestCommandSpec]>,
    ) -> Result<TestResults>;
}

pub struct ProcessTestRunner;

impl TestRunner for ProcessTestRunner {
    fn run_tests(
        &self,
        cwd: &Path,
        config: &TestRunConfig,
        test_commands: Option<&[TestCommandSpec]>,
    ) -> Result<TestResults> {
        let mut results = TestResults::default();

        if config.install_if_missing && cwd.join("package.json").is_file() && !cwd.join("node_modules").is_dir() {
            info!("installing dependencies before running tests");
            let install_result = run_one(&config.install_command, cwd, config.timeout_sec, "install", "install", None)?;
            let failed = install_result.exit_code != 0;
            results.installed_deps = Some(install_result);
            if failed {
                warn!("dependency install failed, skipping test commands");
                return Ok(results);
            }
        }

        let fallback;
        let commands: &[TestCommandSpec] = match test_commands {
            Some(cmds) => cmds,
            None => {
                fallback = vec![
                    TestCommandSpec {
                        id: "unit".to_string(),
                        kind: "unit".to_string(),
                        label: None,
                        command: config.fallback_unit_command.clone(),
                        timeout_sec: None,
                    },
                    TestCommandSpec {
                        id: "e2e".to_string(),
                        kind: "e2e".to_string(),
                        label: None,
                        command: config.fallback_e2e_command.clone(),
                        timeout_sec: None,
                    },
                ];
                &fallback
            }
        };

        for spec in commands {
            if spec.command.is_empty() {
                continue;
            }
            let timeout_sec = spec.timeout_sec.or(config.timeout_sec);
            let result = run_one(&spec.command, cwd, timeout_sec, &spec.id, &spec.kind, spec.label.clone())?;
            results.commands.push(result);
        }

        Ok(results)
    }
}

fn run_one(
    command: &[String],
    cwd: &Path,
    timeout_sec: Option<u64>,
    id: &str,
    kind: &str,
    label: Option<String>,
) -> Result<TestCommandResult> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("empty test command for {id}");
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    let timeout = timeout_sec.map(Duration::from_secs).unwrap_or(UNBOUNDED_TIMEOUT);

    let start = Instant::now();
    let outcome = run_with_timeout(cmd, None, timeout, OUTPUT_LIMIT_BYTES)
        .with_context(|| format!("run test command {id}"))?;
    let duration_ms = start.elapsed().as_millis() as u64;

    if outcome.timed_out {
        let label_text = match timeout_sec {
            Some(s) => format!("Timed out after {s} seconds."),
            None => "Timed out.".to_string(),
        };
        let stderr = outcome.stderr_string();
        let stderr = if stderr.is_empty() {
            label_text
        } else {
            format!("{label_text}\n{stderr}")
        };
        return Ok(TestCommandResult {
            id: id.to_string(),
            kind: kind.to_string(),
            label,
            command: command.to_vec(),
            exit_code: 124,
            stdout: outcome.stdout_string(),
            stderr,
            duration_ms,
            timed_out: true,
        });
    }

    Ok(TestCommandResult {
        id: id.to_string(),
        kind: kind.to_string(),
        label,
        command: command.to_vec(),
        exit_code: outcome.status.code().unwrap_or(-1),
        stdout: outcome.stdout_string(),
        stderr: outcome.stderr_string(),
        duration_ms,
        timed_out: false,
    })
}
