//! User/Admin Broker (§4.5): file-based request/response rendezvous for
//! clarification questions, the initial task prompt, and admin decisions,
//! with an optional Telegram side channel.
//!
//! Grounded in the teacher's `io/run_state.rs` atomic-write idiom (tmp file +
//! rename) and in `original_source/telegram_client.py`'s polling/filtering
//! shape for the side channel hook.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::run_state::RunStateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub request_id: String,
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputResponse {
    pub request_id: String,
    pub questions: Vec<String>,
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialTaskRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialTaskResponse {
    pub request_id: String,
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminDecisionRequest {
    pub request_id: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminDecisionResponse {
    pub request_id: String,
    pub options: Vec<String>,
    pub choice: i64,
    pub notes: Option<String>,
}

/// What a Telegram reply decoded to, interpreted per request kind by the
/// caller (`choose N` for admin decisions, `task: …` for the initial task,
/// free-form text otherwise).
#[derive(Debug, Clone)]
pub enum TelegramReply {
    Choice(i64, Option<String>),
    Task(String),
    Text(String),
}

/// Side channel hook; `io::telegram::TelegramClient` implements this.
pub trait TelegramChannel {
    fn poll_reply(&mut self, request_id: &str) -> Result<Option<TelegramReply>>;

    /// Push a one-way notification (admin requests, handoff summaries,
    /// max-iteration summaries per §6's Telegram protocol).
    fn notify(&mut self, text: &str) -> Result<()>;

    /// Current `getUpdates` offset, persisted by the controller so a resumed
    /// run doesn't re-poll stale updates.
    fn offset(&self) -> Option<i64>;
}

pub struct Broker {
    logs_dir: PathBuf,
    poll_interval: Duration,
}

impl Broker {
    pub fn new(logs_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            poll_interval,
        }
    }

    #[instrument(skip_all, fields(questions = questions.len()))]
    pub fn ask_user_input(
        &self,
        run_state: &RunStateStore,
        questions: Vec<String>,
        timeout: Option<Duration>,
        telegram: Option<&mut dyn TelegramChannel>,
    ) -> Result<Vec<String>> {
        let request_id = new_request_id();
        let request_path = self.path("user_input_request", &request_id);
        let response_path = self.path("user_input_response", &request_id);
        write_atomic(
            &request_path,
            &UserInputRequest {
                request_id: request_id.clone(),
                questions,
            },
        )?;
        run_state.update(|r| r.awaiting_user_input = true)?;

        let result = self.poll(&response_path, timeout, telegram, &request_id, |reply| match reply {
            TelegramReply::Text(text) => Some(vec![text]),
            TelegramReply::Task(task) => Some(vec![task]),
            TelegramReply::Choice(n, notes) => {
                Some(vec![format!("{n}{}", notes.map(|n| format!(" ({n})")).unwrap_or_default())])
            }
        })?;

        run_state.update(|r| r.awaiting_user_input = false)?;
        fs::remove_file(&request_path).ok();

        match result {
            PollOutcome::FromFile(bytes) => {
                let response: UserInputResponse = serde_json::from_slice(&bytes).context("parse user input response")?;
                Ok(response.answers)
            }
            PollOutcome::FromTelegram(answers) => Ok(answers),
        }
    }

    #[instrument(skip_all)]
    pub fn ask_initial_task(
        &self,
        run_state: &RunStateStore,
        timeout: Option<Duration>,
        telegram: Option<&mut dyn TelegramChannel>,
    ) -> Result<String> {
        let request_id = new_request_id();
        let request_path = self.path("initial_task_request", &request_id);
        let response_path = self.path("initial_task_response", &request_id);
        write_atomic(
            &request_path,
            &InitialTaskRequest {
                request_id: request_id.clone(),
            },
        )?;
        run_state.update(|r| r.awaiting_initial_task = true)?;

        let result = self.poll(&response_path, timeout, telegram, &request_id, |reply| match reply {
            TelegramReply::Task(task) => Some(task),
            TelegramReply::Text(text) => Some(text),
            TelegramReply::Choice(..) => None,
        })?;

        run_state.update(|r| r.awaiting_initial_task = false)?;
        fs::remove_file(&request_path).ok();

        match result {
            PollOutcome::FromFile(bytes) => {
                let response: InitialTaskResponse =
                    serde_json::from_slice(&bytes).context("parse initial task response")?;
                Ok(response.task)
            }
            PollOutcome::FromTelegram(task) => Ok(task),
        }
    }

    #[instrument(skip_all, fields(options = options.len()))]
    pub fn ask_admin_decision(
        &self,
        run_state: &RunStateStore,
        options: Vec<String>,
        timeout: Option<Duration>,
        mut telegram: Option<&mut dyn TelegramChannel>,
    ) -> Result<(i64, Option<String>)> {
        let request_id = new_request_id();
        let request_path = self.path("admin_decision_request", &request_id);
        let response_path = self.path("admin_decision_response", &request_id);
        write_atomic(
            &request_path,
            &AdminDecisionRequest {
                request_id: request_id.clone(),
                options: options.clone(),
            },
        )?;
        run_state.update(|r| r.awaiting_admin_decision = true)?;

        if let Some(channel) = telegram.as_deref_mut() {
            let numbered = options
                .iter()
                .enumerate()
                .map(|(i, o)| format!("{i}: {o}"))
                .collect::<Vec<_>>()
                .join("\n");
            let text = format!(
                "Admin decision needed (request_id: {request_id})\n{numbered}\n\nReply with:\nrequest_id: {request_id}\nchoose <N>"
            );
            if let Err(e) = channel.notify(&text) {
                debug!(err = %e, "telegram admin notification failed");
            }
        }

        let result = self.poll(&response_path, timeout, telegram, &request_id, |reply| match reply {
            TelegramReply::Choice(n, notes) => Some((n, notes)),
            _ => None,
        })?;

        run_state.update(|r| r.awaiting_admin_decision = false)?;
        fs::remove_file(&request_path).ok();

        match result {
            PollOutcome::FromFile(bytes) => {
                let response: AdminDecisionResponse =
                    serde_json::from_slice(&bytes).context("parse admin decision response")?;
                Ok((response.choice, response.notes))
            }
            PollOutcome::FromTelegram(pair) => Ok(pair),
        }
    }

    fn path(&self, prefix: &str, request_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{prefix}_{request_id}.json"))
    }

    /// Poll for `response_path` or a matching Telegram reply, whichever comes
    /// first, until `timeout` elapses (or forever if `None`).
    fn poll<T>(
        &self,
        response_path: &Path,
        timeout: Option<Duration>,
        mut telegram: Option<&mut dyn TelegramChannel>,
        request_id: &str,
        from_telegram: impl Fn(TelegramReply) -> Option<T>,
    ) -> Result<PollOutcome<T>> {
        let start = Instant::now();
        loop {
            if response_path.exists() {
                let bytes = fs::read(response_path).with_context(|| format!("read {}", response_path.display()))?;
                return Ok(PollOutcome::FromFile(bytes));
            }
            if let Some(channel) = telegram.as_deref_mut()
                && let Some(reply) = channel.poll_reply(request_id)?
                && let Some(value) = from_telegram(reply)
            {
                return Ok(PollOutcome::FromTelegram(value));
            }
            if let Some(timeout) = timeout
                && start.elapsed() >= timeout
            {
                bail!("broker timed out waiting for response to request {request_id}");
            }
            thread::sleep(self.poll_interval);
        }
    }
}

enum PollOutcome<T> {
    FromFile(Vec<u8>),
    FromTelegram(T),
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut contents = serde_json::to_string_pretty(value)?;
    contents.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes()).context("write temp request")?;
        file.sync_all().context("fsync temp request")?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("rename {} to {}", tmp_path.display(), path.display()))?;
    debug!(path = %path.display(), "wrote broker request");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Run;
    use std::path::PathBuf as StdPathBuf;

    fn store(dir: &Path) -> RunStateStore {
        RunStateStore::create(dir, Run::new("run-1", StdPathBuf::from("/tmp/repo"), "task")).unwrap()
    }

    #[test]
    fn ask_user_input_reads_response_file_and_clears_flag() {
        let temp = tempfile::tempdir().unwrap();
        let state = store(temp.path());
        let broker = Broker::new(temp.path(), Duration::from_millis(10));

        let logs_dir = temp.path().to_path_buf();
        let handle = thread::spawn(move || {
            loop {
                let mut found = None;
                for entry in fs::read_dir(&logs_dir).unwrap() {
                    let entry = entry.unwrap();
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with("user_input_request_") {
                        found = Some(name);
                        break;
                    }
                }
                if let Some(name) = found {
                    let request_id = name
                        .trim_start_matches("user_input_request_")
                        .trim_end_matches(".json")
                        .to_string();
                    let response_path = logs_dir.join(format!("user_input_response_{request_id}.json"));
                    write_atomic(
                        &response_path,
                        &UserInputResponse {
                            request_id,
                            questions: vec!["Q?".to_string()],
                            answers: vec!["A.".to_string()],
                        },
                    )
                    .unwrap();
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        let answers = broker
            .ask_user_input(&state, vec!["Q?".to_string()], Some(Duration::from_secs(5)), None)
            .unwrap();
        handle.join().unwrap();

        assert_eq!(answers, vec!["A.".to_string()]);
        assert!(!state.get().awaiting_user_input);
    }

    #[test]
    fn broker_times_out_without_a_response() {
        let temp = tempfile::tempdir().unwrap();
        let state = store(temp.path());
        let broker = Broker::new(temp.path(), Duration::from_millis(5));

        let err = broker
            .ask_user_input(&state, vec!["Q?".to_string()], Some(Duration::from_millis(50)), None)
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
