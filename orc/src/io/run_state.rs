//! Durable JSON snapshot of a run, plus an append-only history log (§4.1).
//!
//! Writes are atomic: write to `state.json.tmp`, fsync, rename. On read, a
//! JSON parse failure falls back to `state.json.bak` (the previous good
//! version) without mutating in-memory state (Testable Property #8, §7
//! State corruption). All mutation is serialized by an internal lock so the
//! store is safe to share across the fan-out threads of the controller.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::model::Run;

pub struct RunStateStore {
    state_path: PathBuf,
    bak_path: PathBuf,
    history_path: PathBuf,
    inner: Mutex<Run>,
}

impl RunStateStore {
    /// Create a fresh store for `run`, writing its initial snapshot.
    pub fn create(dir: &Path, run: Run) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create run dir {}", dir.display()))?;
        let store = Self {
            state_path: dir.join("state.json"),
            bak_path: dir.join("state.json.bak"),
            history_path: dir.join("history.log"),
            inner: Mutex::new(run),
        };
        store.save()?;
        Ok(store)
    }

    /// Load a previously persisted run from `dir`, falling back to the `.bak`
    /// copy if `state.json` fails to parse.
    pub fn load(dir: &Path) -> Result<Self> {
        let state_path = dir.join("state.json");
        let bak_path = dir.join("state.json.bak");
        let history_path = dir.join("history.log");

        let run = match read_json::<Run>(&state_path) {
            Ok(run) => run,
            Err(primary_err) => read_json::<Run>(&bak_path)
                .with_context(|| format!("primary state unreadable ({primary_err}); .bak also failed"))?,
        };

        Ok(Self {
            state_path,
            bak_path,
            history_path,
            inner: Mutex::new(run),
        })
    }

    pub fn get(&self) -> Run {
        self.inner.lock().expect("run state lock poisoned").clone()
    }

    /// Apply `mutate`, then persist atomically. The lock is held across the
    /// mutation and the write so no other thread can observe a torn update.
    pub fn update<F>(&self, mutate: F) -> Result<Run>
    where
        F: FnOnce(&mut Run),
    {
        let mut guard = self.inner.lock().expect("run state lock poisoned");
        mutate(&mut guard);
        write_atomic(&self.state_path, &self.bak_path, &guard)?;
        Ok(guard.clone())
    }

    pub fn save(&self) -> Result<()> {
        let guard = self.inner.lock().expect("run state lock poisoned");
        write_atomic(&self.state_path, &self.bak_path, &guard)
    }

    /// Append one timestamped line to `history.log`, flushing immediately.
    pub fn append_history(&self, event: &str) -> Result<()> {
        let _guard = self.inner.lock().expect("run state lock poisoned");
        let timestamp = chrono::Utc::now().to_rfc3339();
        let line = format!("[{timestamp}] {event}\n");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| format!("open {}", self.history_path.display()))?;
        file.write_all(line.as_bytes()).context("append history")?;
        file.flush().context("flush history")?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_atomic(state_path: &Path, bak_path: &Path, run: &Run) -> Result<()> {
    let parent = state_path
        .parent()
        .ok_or_else(|| anyhow!("state path {} has no parent", state_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    if state_path.exists() {
        fs::copy(state_path, bak_path)
            .with_context(|| format!("back up {} to {}", state_path.display(), bak_path.display()))?;
    }

    let mut contents = serde_json::to_string_pretty(run)?;
    contents.push('\n');

    let tmp_path = state_path.with_extension("json.tmp");
    let mut tmp_file =
        File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    tmp_file.write_all(contents.as_bytes()).context("write temp state")?;
    tmp_file.sync_all().context("fsync temp state")?;
    drop(tmp_file);

    fs::rename(&tmp_path, state_path)
        .with_context(|| format!("rename {} to {}", tmp_path.display(), state_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::run::{OrchestratorMode, RunStatus, Stage};
    use std::path::PathBuf;

    fn sample_run() -> Run {
        Run::new("run-abc", PathBuf::from("/tmp/repo"), "do the thing")
    }

    #[test]
    fn round_trips_through_create_and_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run-abc");
        let store = RunStateStore::create(&run_dir, sample_run()).expect("create");
        store
            .update(|r| {
                r.iteration = 3;
                r.stage = Stage::Reviewing;
            })
            .expect("update");

        let reloaded = RunStateStore::load(&run_dir).expect("load");
        let run = reloaded.get();
        assert_eq!(run.iteration, 3);
        assert_eq!(run.stage, Stage::Reviewing);
    }

    #[test]
    fn falls_back_to_bak_when_primary_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run-abc");
        let store = RunStateStore::create(&run_dir, sample_run()).expect("create");
        store.update(|r| r.iteration = 2).expect("update");

        fs::write(run_dir.join("state.json"), b"{not valid json").expect("corrupt primary");

        let reloaded = RunStateStore::load(&run_dir).expect("load falls back to .bak");
        assert_eq!(reloaded.get().iteration, 1);
    }

    #[test]
    fn history_is_append_only_and_flushed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run-abc");
        let store = RunStateStore::create(&run_dir, sample_run()).expect("create");
        store.append_history("stage=planning").expect("append");
        store.append_history("stage=executing").expect("append");

        let contents = fs::read_to_string(run_dir.join("history.log")).expect("read history");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("stage=planning"));
        assert!(lines[1].ends_with("stage=executing"));
    }

    #[test]
    fn concurrent_updates_never_interleave() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run-abc");
        let store = std::sync::Arc::new(
            RunStateStore::create(&run_dir, sample_run()).expect("create"),
        );

        std::thread::scope(|scope| {
            for n in 1..=8u32 {
                let store = store.clone();
                scope.spawn(move || {
                    store.update(|r| r.iteration = n).expect("update");
                });
            }
        });

        // No panic, and the final on-disk state parses cleanly.
        let reloaded = RunStateStore::load(&run_dir).expect("load");
        assert!(reloaded.get().iteration <= 8);
        assert_eq!(reloaded.get().orchestrator_mode, OrchestratorMode::Multi);
        assert_eq!(reloaded.get().run_status, RunStatus::Running);
    }
}
