//! Resume Engine (§4.8): find a prior run on disk and infer where in the
//! pipeline it should re-enter.
//!
//! Candidates and plans are ephemeral (not persisted on `Run`, per spec.md
//! §3's field list), so this crate cannot skip straight into the middle of
//! an iteration the way a richer state store could — a resumed run always
//! restarts the in-progress iteration at planning, using whatever
//! `user_qna` and `iteration` count were last persisted. `infer_resume_step`
//! still computes the stage→step mapping §4.8 describes, for history
//! logging and for recognizing the two cases that skip re-entry entirely:
//! a run already `Complete`, and a `ReviewReady`/`Merging` run that was
//! already approved but crashed before persisting.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};

use crate::core::validate::validate_resume_id;
use crate::io::run_state::RunStateStore;
use crate::model::run::{Run, RunStatus, Stage};

/// Where a resumed run re-enters the pipeline, per §4.8's stage→step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStep {
    Plan,
    Execute,
    Review,
    Persist,
}

/// `ReviewReady`/`Merging` additionally depend on whether the run was
/// already approved: an approved-but-unpersisted run jumps to `Persist`
/// instead of re-reviewing a now-stale candidate set.
pub fn infer_resume_step(run: &Run) -> ResumeStep {
    match run.stage {
        Stage::Planning | Stage::Idle | Stage::AwaitingInitialTask | Stage::AwaitingUserInput => ResumeStep::Plan,
        Stage::PlanReady | Stage::Executing => ResumeStep::Execute,
        Stage::TestsReady | Stage::Reviewing => ResumeStep::Review,
        Stage::ReviewReady | Stage::Merging => {
            if run.approved {
                ResumeStep::Persist
            } else {
                ResumeStep::Review
            }
        }
        Stage::Complete | Stage::PersistenceFailed | Stage::Failed => ResumeStep::Persist,
    }
}

/// Scan `logs_root` for a run directory matching `repo_path` with
/// `run_status=running`, returning the most recently modified match. Used
/// when the user gave neither a task prompt nor `--resume-run-id`.
pub fn find_resumable_run(logs_root: &Path, repo_path: &Path) -> Result<Option<PathBuf>> {
    let repo_path = repo_path.canonicalize().unwrap_or_else(|_| repo_path.to_path_buf());
    let mut best: Option<(SystemTime, PathBuf)> = None;

    let entries = match fs::read_dir(logs_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", logs_root.display())),
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", logs_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let state_path = run_dir.join("state.json");
        let Ok(store) = RunStateStore::load(&run_dir) else {
            continue;
        };
        let run = store.get();
        if run.run_status != RunStatus::Running {
            continue;
        }
        let run_repo = run.repo_path.canonicalize().unwrap_or_else(|_| run.repo_path.clone());
        if run_repo != repo_path {
            continue;
        }
        let modified = fs::metadata(&state_path).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(best_time, _)| modified > *best_time) {
            best = Some((modified, run_dir));
        }
    }

    Ok(best.map(|(_, path)| path))
}

/// Resolve an explicit `--resume-run-id`, validating it against path-escape
/// tricks and cross-checking the stored `repo_path` (the "Resume mismatch"
/// error case in §7: refuse when `repo_path` differs or the run already
/// completed).
pub fn resolve_resume_target(logs_root: &Path, resume_run_id: &str, repo_path: &Path) -> Result<PathBuf> {
    let run_dir = validate_resume_id(resume_run_id, logs_root).map_err(anyhow::Error::msg)?;
    if !run_dir.join("state.json").is_file() {
        bail!("no run state found for resume id '{resume_run_id}'");
    }

    let store = RunStateStore::load(&run_dir)?;
    let run = store.get();

    let repo_path = repo_path.canonicalize().unwrap_or_else(|_| repo_path.to_path_buf());
    let run_repo = run.repo_path.canonicalize().unwrap_or_else(|_| run.repo_path.clone());
    if run_repo != repo_path {
        bail!(
            "run '{resume_run_id}' was started against {} but current repo is {}",
            run_repo.display(),
            repo_path.display()
        );
    }
    if run.run_status != RunStatus::Running {
        bail!("run '{resume_run_id}' is not running (status={:?})", run.run_status);
    }

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_run(dir: &Path, repo_path: &Path, status: RunStatus, stage: Stage) -> Run {
        let mut run = Run::new("run-1", repo_path.to_path_buf(), "do the thing");
        run.run_status = status;
        run.stage = stage;
        RunStateStore::create(dir, run.clone()).expect("create run state");
        run
    }

    #[test]
    fn infer_resume_step_maps_each_stage() {
        let mut run = Run::new("r", PathBuf::from("/tmp/repo"), "t");
        run.stage = Stage::Planning;
        assert_eq!(infer_resume_step(&run), ResumeStep::Plan);

        run.stage = Stage::PlanReady;
        assert_eq!(infer_resume_step(&run), ResumeStep::Execute);

        run.stage = Stage::TestsReady;
        assert_eq!(infer_resume_step(&run), ResumeStep::Review);

        run.stage = Stage::ReviewReady;
        run.approved = false;
        assert_eq!(infer_resume_step(&run), ResumeStep::Review);
        run.approved = true;
        assert_eq!(infer_resume_step(&run), ResumeStep::Persist);

        run.stage = Stage::Complete;
        assert_eq!(infer_resume_step(&run), ResumeStep::Persist);
    }

    #[test]
    fn find_resumable_run_picks_most_recently_modified_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path().join("logs");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();

        write_run(&logs_root.join("run-old"), &repo, RunStatus::Running, Stage::Planning);
        std::thread::sleep(std::time::Duration::from_millis(10));
        write_run(&logs_root.join("run-new"), &repo, RunStatus::Running, Stage::Reviewing);

        let found = find_resumable_run(&logs_root, &repo).expect("scan").expect("a match");
        assert_eq!(found, logs_root.join("run-new"));
    }

    #[test]
    fn find_resumable_run_ignores_other_repos_and_completed_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path().join("logs");
        let repo = temp.path().join("repo");
        let other_repo = temp.path().join("other");
        fs::create_dir_all(&repo).unwrap();
        fs::create_dir_all(&other_repo).unwrap();

        write_run(&logs_root.join("run-other-repo"), &other_repo, RunStatus::Running, Stage::Planning);
        write_run(&logs_root.join("run-done"), &repo, RunStatus::Idle, Stage::Complete);

        let found = find_resumable_run(&logs_root, &repo).expect("scan");
        assert!(found.is_none());
    }

    #[test]
    fn resolve_resume_target_rejects_repo_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path().join("logs");
        let repo = temp.path().join("repo");
        let other_repo = temp.path().join("other");
        fs::create_dir_all(&repo).unwrap();
        fs::create_dir_all(&other_repo).unwrap();

        write_run(&logs_root.join("run-1"), &repo, RunStatus::Running, Stage::Planning);

        let err = resolve_resume_target(&logs_root, "run-1", &other_repo).unwrap_err();
        assert!(err.to_string().contains("but current repo is"));
    }

    #[test]
    fn resolve_resume_target_accepts_matching_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path().join("logs");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();

        write_run(&logs_root.join("run-1"), &repo, RunStatus::Running, Stage::Planning);

        let resolved = resolve_resume_target(&logs_root, "run-1", &repo).expect("resolve");
        assert_eq!(resolved, logs_root.join("run-1"));
    }

    #[test]
    fn resolve_resume_target_rejects_unsafe_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path().join("logs");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        assert!(resolve_resume_target(&logs_root, "../escape", &repo).is_err());
    }
}
