//! Structured agent calls for both CLI wire families (§SPEC §"Agent Clients").
//!
//! Generalizes the teacher's `io::executor::{Executor, ExecRequest,
//! execute_and_load}` (Family A, single-shot JSON via an output file) with a
//! second client for Family B (NDJSON stream tailing with heartbeats). Both
//! return a loosely-typed [`AgentCallOutcome`]; the caller picks the concrete
//! `from_payload`/`parse_*` routine for what it expects back (`Plan`,
//! `ExecutorOutput`, `ReviewerDecision`).

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::io::process::{run_with_stream, run_with_timeout};
use crate::model::agent_spec::{AgentCallContext, AgentFamily};
use crate::model::AgentSpec;

/// Result of one structured agent invocation.
pub struct AgentCallOutcome {
    /// Best-effort parsed JSON payload (already unwrapped out of a
    /// `structured_output` envelope where the wire format has one).
    pub payload: serde_json::Value,
    /// Raw text the payload was extracted from, for the synthesize-on-failure
    /// fallback in `ExecutorOutput::from_payload`/`core::validate::parse_*`.
    pub raw_text: String,
    pub exit_code: i32,
}

pub trait AgentClient {
    fn call(
        &self,
        spec: &AgentSpec,
        ctx: &AgentCallContext,
        prompt: &str,
        schema_path: &Path,
        phase: &str,
    ) -> Result<AgentCallOutcome>;
}

/// Dispatches to the Family A or Family B implementation by `spec.family`.
pub struct ProcessAgentClient {
    pub heartbeat: Duration,
}

impl Default for ProcessAgentClient {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
        }
    }
}

impl AgentClient for ProcessAgentClient {
    #[instrument(skip_all, fields(agent = %spec.id, family = ?spec.family, phase))]
    fn call(
        &self,
        spec: &AgentSpec,
        ctx: &AgentCallContext,
        prompt: &str,
        schema_path: &Path,
        phase: &str,
    ) -> Result<AgentCallOutcome> {
        match spec.family {
            AgentFamily::A => call_family_a(spec, ctx, prompt, schema_path, phase),
            AgentFamily::B => call_family_b(spec, ctx, prompt, schema_path, phase, self.heartbeat),
        }
    }
}

fn open_frame(family: AgentFamily, phase: &str) -> String {
    format!(
        "=== {} {} {} ===\n",
        Utc::now().to_rfc3339(),
        family_label(family),
        phase
    )
}

fn close_frame(family: AgentFamily, code: i32) -> String {
    format!("=== {} exit {} ===\n", family_label(family), code)
}

fn family_label(family: AgentFamily) -> &'static str {
    match family {
        AgentFamily::A => "reviewer_family",
        AgentFamily::B => "executor_family",
    }
}

fn append_log(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(text.as_bytes()).context("append log")?;
    file.flush().context("flush log")
}

/// Enforces `approval_policy=never` plus a role-appropriate sandbox via `-c
/// key=value` overrides, never positional flags, per §SPEC Family A.
fn family_a_overrides(spec: &AgentSpec) -> Vec<String> {
    let sandbox = if spec.allows_side_effects() {
        "workspace-write"
    } else {
        "read-only"
    };
    let mut overrides = vec![
        "-c".to_string(),
        "approval_policy=never".to_string(),
        "-c".to_string(),
        format!("sandbox={sandbox}"),
    ];
    if let Some(effort) = &spec.reasoning_effort {
        overrides.push("-c".to_string());
        overrides.push(format!("model_reasoning_effort={effort}"));
    }
    overrides
}

#[instrument(skip_all, fields(agent = %spec.id))]
fn call_family_a(
    spec: &AgentSpec,
    ctx: &AgentCallContext,
    prompt: &str,
    schema_path: &Path,
    phase: &str,
) -> Result<AgentCallOutcome> {
    if !schema_path.exists() {
        return Err(anyhow!("missing output schema {}", schema_path.display()));
    }
    let output_path = ctx.log_path.with_extension("output.json");
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    append_log(&ctx.log_path, &open_frame(AgentFamily::A, phase))?;

    let mut command = spec.default_command();
    let program = command.remove(0);
    let mut cmd = Command::new(program);
    cmd.args(&command);
    cmd.args(family_a_overrides(spec));
    if let Some(model) = &spec.model {
        cmd.arg("-c").arg(format!("model={model}"));
    }
    cmd.arg("--output-schema")
        .arg(schema_path)
        .arg("--output-last-message")
        .arg(&output_path)
        .arg("-")
        .current_dir(&ctx.workdir);

    let outcome = run_with_timeout(cmd, Some(prompt.as_bytes()), ctx.timeout, ctx.output_limit_bytes)
        .context("run Family A agent")?;

    append_log(&ctx.log_path, &outcome.stdout_string())?;
    if !outcome.stderr.is_empty() {
        append_log(&ctx.log_path, &outcome.stderr_string())?;
    }
    let code = outcome.status.code().unwrap_or(-1);
    append_log(&ctx.log_path, &close_frame(AgentFamily::A, code))?;

    if outcome.timed_out {
        return Err(anyhow!("{} timed out after {:?}", spec.id, ctx.timeout));
    }
    if !outcome.status.success() {
        return Err(anyhow!("{} exited with status {}", spec.id, code));
    }
    if !output_path.exists() {
        return Err(anyhow!("missing output message at {}", output_path.display()));
    }

    let raw_text =
        fs::read_to_string(&output_path).with_context(|| format!("read {}", output_path.display()))?;
    let payload: serde_json::Value =
        serde_json::from_str(&raw_text).with_context(|| format!("parse {}", output_path.display()))?;

    debug!("family A call completed");
    Ok(AgentCallOutcome {
        payload,
        raw_text,
        exit_code: code,
    })
}

#[instrument(skip_all, fields(agent = %spec.id, heartbeat_secs = heartbeat.as_secs()))]
fn call_family_b(
    spec: &AgentSpec,
    ctx: &AgentCallContext,
    prompt: &str,
    schema_path: &Path,
    phase: &str,
    heartbeat: Duration,
) -> Result<AgentCallOutcome> {
    let _ = schema_path; // Family B constrains output via prompt instructions, not --output-schema.
    append_log(&ctx.log_path, &open_frame(AgentFamily::B, phase))?;

    let stream_path = ctx
        .stream_path
        .clone()
        .unwrap_or_else(|| ctx.log_path.with_extension("stream.jsonl"));

    let mut command = spec.default_command();
    let program = command.remove(0);
    let mut cmd = Command::new(program);
    cmd.args(&command);
    cmd.arg("--output-format").arg("stream-json").arg("--verbose");
    if let Some(resume_id) = &ctx.resume_session_id {
        cmd.arg("--resume").arg(resume_id);
    }
    if let Some(model) = &spec.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(tools) = &spec.allowed_tools {
        cmd.arg("--allowed-tools").arg(tools.join(","));
    }
    cmd.arg("-p").current_dir(&ctx.workdir);

    let done = Arc::new(AtomicBool::new(false));
    let monitor = spawn_heartbeat_monitor(done.clone(), stream_path.clone(), ctx.log_path.clone(), heartbeat);

    let outcome = run_with_stream(
        cmd,
        Some(prompt.as_bytes()),
        ctx.timeout,
        ctx.output_limit_bytes,
        Some(&stream_path),
    );
    done.store(true, Ordering::SeqCst);
    monitor.join().ok();

    let outcome = outcome.context("run Family B agent")?;
    let code = outcome.status.code().unwrap_or(-1);

    if !outcome.stderr.is_empty() {
        append_log(&ctx.log_path, &outcome.stderr_string())?;
    }
    append_log(&ctx.log_path, &close_frame(AgentFamily::B, code))?;

    if outcome.timed_out {
        return Err(anyhow!("{} timed out after {:?}", spec.id, ctx.timeout));
    }

    let (result_event, last_event, raw_text) = tail_ndjson(&stream_path)?;
    let event = result_event.or(last_event).ok_or_else(|| {
        anyhow!("{} produced no parseable NDJSON events", spec.id)
    })?;

    let payload = event
        .get("structured_output")
        .cloned()
        .unwrap_or(event);

    debug!("family B call completed");
    Ok(AgentCallOutcome {
        payload,
        raw_text,
        exit_code: code,
    })
}

/// Parse `path` line by line; return (`type=result` event, last parseable
/// event, raw text of whichever event is kept) per §SPEC Family B.
fn tail_ndjson(path: &Path) -> Result<(Option<serde_json::Value>, Option<serde_json::Value>, String)> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut last: Option<serde_json::Value> = None;
    let mut result: Option<serde_json::Value> = None;
    let mut raw_text = String::new();

    for line in reader.lines() {
        let line = line.context("read NDJSON line")?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if value.get("type").and_then(|t| t.as_str()) == Some("result") {
                result = Some(value.clone());
                raw_text = line.clone();
            }
            last = Some(value);
        }
    }
    if result.is_none()
        && let Some(value) = &last
    {
        raw_text = serde_json::to_string(value).unwrap_or_default();
    }
    Ok((result, last, raw_text))
}

/// Appends a heartbeat marker to `log_path` every `interval` of no growth in
/// `stream_path`'s size, until `done` is set.
fn spawn_heartbeat_monitor(
    done: Arc<AtomicBool>,
    stream_path: PathBuf,
    log_path: PathBuf,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_len = 0u64;
        let mut last_change = Instant::now();
        let poll = Duration::from_millis(200).min(interval);
        while !done.load(Ordering::SeqCst) {
            thread::sleep(poll);
            let len = fs::metadata(&stream_path).map(|m| m.len()).unwrap_or(0);
            if len != last_len {
                last_len = len;
                last_change = Instant::now();
                continue;
            }
            if last_change.elapsed() >= interval {
                let line = format!("--- heartbeat ({}s idle) ---\n", interval.as_secs());
                if let Err(e) = append_log(&log_path, &line) {
                    warn!(err = %e, "failed to write heartbeat");
                }
                last_change = Instant::now();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent_spec::AgentRole;
    use std::time::Duration as StdDuration;

    fn family_a_spec() -> AgentSpec {
        AgentSpec {
            id: "reviewer-1".to_string(),
            family: AgentFamily::A,
            role: AgentRole::Reviewer,
            command: Some(vec!["sh".to_string(), "-c".to_string(), FAKE_CODEX_SCRIPT.to_string()]),
            model: None,
            reasoning_effort: None,
            verbosity: None,
            max_turns: None,
            allowed_tools: None,
            turn_budget: None,
        }
    }

    // A fake Family-A CLI: ignores its args, reads the schema path + output
    // path off argv, writes a canned JSON message to the output path.
    const FAKE_CODEX_SCRIPT: &str = r#"
        while [ "$#" -gt 0 ]; do
            case "$1" in
                --output-last-message) shift; OUT="$1" ;;
            esac
            shift
        done
        cat >/dev/null
        printf '{"status":"OK","claude_prompt":"do it","tasks":[{"id":"t1","title":"T","description":"D"}]}' > "$OUT"
    "#;

    #[test]
    fn family_a_reads_output_last_message_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema_path = temp.path().join("schema.json");
        fs::write(&schema_path, "{}").unwrap();
        let ctx = AgentCallContext {
            workdir: temp.path().to_path_buf(),
            log_path: temp.path().join("agent.log"),
            timeout: StdDuration::from_secs(5),
            output_limit_bytes: 8192,
            stream_path: None,
            resume_session_id: None,
        };
        let client = ProcessAgentClient::default();
        let spec = family_a_spec();

        let outcome = client.call(&spec, &ctx, "prompt text", &schema_path, "plan").expect("call");
        assert_eq!(outcome.payload["status"], "OK");
        assert!(ctx.log_path.exists());
        let log = fs::read_to_string(&ctx.log_path).unwrap();
        assert!(log.contains("reviewer_family plan"));
        assert!(log.contains("exit 0"));
    }

    #[test]
    fn tail_ndjson_prefers_result_event_and_unwraps_structured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stream.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"type\":\"assistant\",\"text\":\"working\"}\n",
                "{\"type\":\"result\",\"structured_output\":{\"status\":\"DONE\",\"summary\":\"ok\"}}\n",
            ),
        )
        .unwrap();

        let (result, last, _raw) = tail_ndjson(&path).unwrap();
        assert!(result.is_some());
        assert!(last.is_some());
        let payload = result.unwrap().get("structured_output").cloned().unwrap();
        assert_eq!(payload["status"], "DONE");
    }

    #[test]
    fn heartbeat_monitor_appends_marker_when_stream_is_idle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream_path = temp.path().join("stream.jsonl");
        let log_path = temp.path().join("agent.log");
        fs::write(&stream_path, "").unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let handle = spawn_heartbeat_monitor(
            done.clone(),
            stream_path.clone(),
            log_path.clone(),
            Duration::from_millis(50),
        );
        thread::sleep(Duration::from_millis(300));
        done.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        let log = fs::read_to_string(&log_path).unwrap_or_default();
        assert!(log.contains("heartbeat"));
    }
}
