//! Workspace Manager (§4.2): materialize, diff, apply-back, and clean up
//! candidate sandboxes.
//!
//! Grounded in `original_source/workspace_manager.py`'s copy+baseline sync
//! algorithm, extended with the symlink refusal and worktree-reuse rules §4.2
//! adds on top of it, and in the teacher's `io/git.rs` for the git plumbing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::core::branch::{candidate_branch_name, run_branch_name};
use crate::io::git::Git;
use crate::model::{Workspace, WorkspaceStrategy};

const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".DS_Store",
    "logs",
];

pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).with_context(|| format!("create {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// Strategy `auto` resolves to `worktree` when the repo is a git repo with
    /// at least one commit and worktrees are permitted; otherwise `copy`.
    fn resolve_strategy(
        &self,
        repo: &Path,
        strategy: WorkspaceStrategy,
        use_git_worktree: bool,
    ) -> WorkspaceStrategy {
        match strategy {
            WorkspaceStrategy::Auto => {
                if use_git_worktree && Git::is_repo(repo) && Git::has_commit(repo) {
                    WorkspaceStrategy::Worktree
                } else {
                    WorkspaceStrategy::Copy
                }
            }
            other => other,
        }
    }

    /// Create the run-level workspace.
    pub fn create(
        &self,
        repo: &Path,
        run_id: &str,
        strategy: WorkspaceStrategy,
        use_git_worktree: bool,
        branch_prefix: &str,
    ) -> Result<Workspace> {
        let repo = repo
            .canonicalize()
            .with_context(|| format!("resolve repo path {}", repo.display()))?;
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;
        let strategy = self.resolve_strategy(&repo, strategy, use_git_worktree);

        match strategy {
            WorkspaceStrategy::Worktree => {
                let branch = run_branch_name(branch_prefix, run_id);
                let path = run_dir.join("worktree");
                let git = Git::new(&repo);
                git.worktree_add(&path, &branch)?;
                Ok(Workspace {
                    repo_path: repo,
                    path,
                    strategy: WorkspaceStrategy::Worktree,
                    run_dir,
                    baseline_path: None,
                    branch_name: Some(branch),
                })
            }
            WorkspaceStrategy::Copy | WorkspaceStrategy::InPlace => {
                self.create_copy_or_in_place(&repo, &run_dir, strategy)
            }
            WorkspaceStrategy::Auto => unreachable!("resolve_strategy never returns Auto"),
        }
    }

    /// Create a candidate workspace for `iteration`/`candidate_id`, optionally
    /// carrying forward `source` (the prior winning candidate's tree) instead
    /// of the pristine repo.
    pub fn create_candidate(
        &self,
        repo: &Path,
        source: &Path,
        run_id: &str,
        iteration: u32,
        candidate_id: &str,
        strategy: WorkspaceStrategy,
        use_git_worktree: bool,
        branch_prefix: &str,
        branch_suffix_len: usize,
    ) -> Result<Workspace> {
        let repo = repo
            .canonicalize()
            .with_context(|| format!("resolve repo path {}", repo.display()))?;
        let cand_dir = self.run_dir(run_id).join(candidate_id);
        fs::create_dir_all(&cand_dir)?;
        let strategy = self.resolve_strategy(&repo, strategy, use_git_worktree);

        match strategy {
            WorkspaceStrategy::Worktree => {
                let branch =
                    candidate_branch_name(branch_prefix, run_id, iteration, candidate_id, branch_suffix_len);
                let path = cand_dir.join("worktree");
                let git = Git::new(&repo);
                git.worktree_add(&path, &branch)?;
                Ok(Workspace {
                    repo_path: repo,
                    path,
                    strategy: WorkspaceStrategy::Worktree,
                    run_dir: cand_dir,
                    baseline_path: None,
                    branch_name: Some(branch),
                })
            }
            WorkspaceStrategy::Copy => self.create_copy_from(source, &repo, &cand_dir),
            WorkspaceStrategy::InPlace => {
                bail!("in_place strategy cannot be used for a per-candidate workspace")
            }
            WorkspaceStrategy::Auto => unreachable!("resolve_strategy never returns Auto"),
        }
    }

    /// Reattach to a previously created workspace (crash-resume), without
    /// recreating anything.
    pub fn resume_candidate(
        &self,
        repo: &Path,
        run_id: &str,
        candidate_id: &str,
        path: &Path,
        strategy: WorkspaceStrategy,
    ) -> Result<Workspace> {
        let repo = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        let run_dir = self.run_dir(run_id).join(candidate_id);
        let baseline_path = run_dir.join("baseline");
        Ok(Workspace {
            repo_path: repo,
            path: path.to_path_buf(),
            strategy,
            run_dir,
            baseline_path: if baseline_path.is_dir() {
                Some(baseline_path)
            } else {
                None
            },
            branch_name: None,
        })
    }

    fn create_copy_or_in_place(
        &self,
        repo: &Path,
        run_dir: &Path,
        strategy: WorkspaceStrategy,
    ) -> Result<Workspace> {
        let baseline_path = run_dir.join("baseline");
        let ignore = self.ignore_patterns(repo);

        if !baseline_path.is_dir() {
            copy_tree(repo, &baseline_path, &ignore)?;
        }

        if strategy == WorkspaceStrategy::InPlace {
            return Ok(Workspace {
                repo_path: repo.to_path_buf(),
                path: repo.to_path_buf(),
                strategy: WorkspaceStrategy::InPlace,
                run_dir: run_dir.to_path_buf(),
                baseline_path: Some(baseline_path),
                branch_name: None,
            });
        }

        let workspace_path = run_dir.join("workspace");
        if !workspace_path.is_dir() {
            copy_tree(&baseline_path, &workspace_path, &[])?;
        }

        Ok(Workspace {
            repo_path: repo.to_path_buf(),
            path: workspace_path,
            strategy: WorkspaceStrategy::Copy,
            run_dir: run_dir.to_path_buf(),
            baseline_path: Some(baseline_path),
            branch_name: None,
        })
    }

    fn create_copy_from(&self, source: &Path, repo: &Path, cand_dir: &Path) -> Result<Workspace> {
        let baseline_path = cand_dir.join("baseline");
        let workspace_path = cand_dir.join("workspace");
        let ignore = self.ignore_patterns(repo);

        if !baseline_path.is_dir() {
            copy_tree(source, &baseline_path, &ignore)?;
        }
        if !workspace_path.is_dir() {
            copy_tree(&baseline_path, &workspace_path, &[])?;
        }

        Ok(Workspace {
            repo_path: repo.to_path_buf(),
            path: workspace_path,
            strategy: WorkspaceStrategy::Copy,
            run_dir: cand_dir.to_path_buf(),
            baseline_path: Some(baseline_path),
            branch_name: None,
        })
    }

    fn ignore_patterns(&self, repo: &Path) -> Vec<String> {
        let mut patterns: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
        if let Ok(rel) = self.base_dir.strip_prefix(repo)
            && let Some(first) = rel.components().next()
        {
            patterns.push(first.as_os_str().to_string_lossy().into_owned());
        }
        patterns
    }

    /// Unified diff for `workspace`: `git diff` for git-backed strategies,
    /// else `git diff --no-index baseline workspace`, else empty.
    pub fn get_diff(&self, workspace: &Workspace) -> Result<String> {
        match workspace.strategy {
            WorkspaceStrategy::Worktree | WorkspaceStrategy::InPlace if Git::is_repo(&workspace.path) => {
                Git::new(&workspace.path).diff()
            }
            _ => match &workspace.baseline_path {
                Some(baseline) => Git::diff_no_index(baseline, &workspace.path),
                None => Ok(String::new()),
            },
        }
    }

    /// Copy-strategy apply-back: copy every file workspace→repo, delete from
    /// repo every file present in baseline but absent from workspace.
    /// Refuses to write through symlinked directories or overwrite a
    /// symlinked destination file (Testable Property #7).
    pub fn apply_to_repo(&self, workspace: &Workspace) -> Result<()> {
        if workspace.strategy != WorkspaceStrategy::Copy {
            return Ok(());
        }
        let baseline = workspace
            .baseline_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("copy workspace has no baseline snapshot"))?;

        let workspace_files = relative_files(&workspace.path)?;
        let baseline_files = relative_files(baseline)?;

        for rel in &workspace_files {
            let src = workspace.path.join(rel);
            copy_refusing_symlinks(&workspace.repo_path, rel, &src)?;
        }

        for rel in baseline_files.difference(&workspace_files) {
            remove_plain_file(&workspace.repo_path, rel)?;
        }

        Ok(())
    }

    pub fn commit_changes(&self, workspace: &Workspace, message: &str) -> Result<Option<String>> {
        if !Git::is_repo(&workspace.path) {
            return Ok(None);
        }
        let git = Git::new(&workspace.path);
        if !git.commit_staged(message)? {
            git.add_all()?;
            if !git.commit_staged(message)? {
                return Ok(None);
            }
        }
        Ok(Some(git.rev_parse("HEAD")?))
    }

    /// Remove every git worktree registered under `workspace.run_dir`, deepest
    /// path first, then delete the run directory tree.
    pub fn cleanup(&self, workspace: &Workspace) -> Result<()> {
        if Git::is_repo(&workspace.repo_path) {
            let git = Git::new(&workspace.repo_path);
            if let Ok(entries) = git.worktree_list() {
                let mut under_run_dir: Vec<_> = entries
                    .into_iter()
                    .filter(|e| e.path.starts_with(&workspace.run_dir))
                    .collect();
                under_run_dir.sort_by(|a, b| b.path.components().count().cmp(&a.path.components().count()));
                for entry in under_run_dir {
                    git.worktree_remove_force(&entry.path).ok();
                }
                git.worktree_prune().ok();
            }
        }
        if workspace.run_dir.is_dir() {
            fs::remove_dir_all(&workspace.run_dir)
                .with_context(|| format!("remove {}", workspace.run_dir.display()))?;
        }
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path, ignore: &[String]) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in WalkDir::new(src).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !ignore.iter().any(|pat| pat == name.as_ref())
    }) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src).expect("walkdir yields paths under src");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dst_path = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dst_path)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dst_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copy {} to {}", entry.path().display(), dst_path.display()))?;
        }
    }
    Ok(())
}

fn relative_files(root: &Path) -> Result<std::collections::HashSet<PathBuf>> {
    let mut files = std::collections::HashSet::new();
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).expect("walkdir yields paths under root");
            files.insert(rel.to_path_buf());
        }
    }
    Ok(files)
}

fn copy_refusing_symlinks(repo_root: &Path, rel: &Path, src: &Path) -> Result<()> {
    let dst = ensure_no_symlink_parents(repo_root, rel)?;
    if let Ok(meta) = fs::symlink_metadata(&dst)
        && meta.file_type().is_symlink()
    {
        bail!("refusing to overwrite symlinked destination {}", dst.display());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(src, &dst).with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

fn remove_plain_file(repo_root: &Path, rel: &Path) -> Result<()> {
    let dst = repo_root.join(rel);
    if let Ok(meta) = fs::symlink_metadata(&dst)
        && meta.is_file()
        && !meta.file_type().is_symlink()
    {
        fs::remove_file(&dst).with_context(|| format!("remove {}", dst.display()))?;
    }
    Ok(())
}

/// Every destination path must resolve under `repo_root`; refuse if any
/// parent directory component is a symlink.
fn ensure_no_symlink_parents(repo_root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut current = repo_root.to_path_buf();
    if let Some(parent) = rel.parent() {
        for component in parent.components() {
            current.push(component);
            if let Ok(meta) = fs::symlink_metadata(&current)
                && meta.file_type().is_symlink()
            {
                bail!(
                    "refusing to write through symlinked directory component {}",
                    current.display()
                );
            }
        }
    }
    Ok(repo_root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn git_init(path: &Path) {
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(path)
                .status()
                .expect("run git");
            assert!(status.success());
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "T"]);
        fs::write(path.join("a.txt"), "one\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn copy_strategy_apply_then_diff_is_empty() {
        let repo_dir = tempfile::tempdir().unwrap();
        git_init(repo_dir.path());
        let base_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(base_dir.path()).unwrap();

        let ws = mgr
            .create(repo_dir.path(), "run-1", WorkspaceStrategy::Copy, false, "orc")
            .unwrap();
        assert_eq!(ws.strategy, WorkspaceStrategy::Copy);

        mgr.apply_to_repo(&ws).unwrap();
        let diff_after_apply =
            Git::diff_no_index(ws.baseline_path.as_ref().unwrap(), &ws.path).unwrap();
        assert!(diff_after_apply.is_empty());
    }

    #[test]
    fn apply_to_repo_copies_edits_and_deletes_removed_files() {
        let repo_dir = tempfile::tempdir().unwrap();
        git_init(repo_dir.path());
        let base_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(base_dir.path()).unwrap();
        let ws = mgr
            .create(repo_dir.path(), "run-1", WorkspaceStrategy::Copy, false, "orc")
            .unwrap();

        fs::write(ws.path.join("a.txt"), "edited\n").unwrap();
        fs::write(ws.path.join("new.txt"), "brand new\n").unwrap();

        mgr.apply_to_repo(&ws).unwrap();

        assert_eq!(fs::read_to_string(repo_dir.path().join("a.txt")).unwrap(), "edited\n");
        assert_eq!(
            fs::read_to_string(repo_dir.path().join("new.txt")).unwrap(),
            "brand new\n"
        );
    }

    #[test]
    fn apply_to_repo_refuses_symlinked_destination() {
        let repo_dir = tempfile::tempdir().unwrap();
        git_init(repo_dir.path());
        symlink("/etc/passwd", repo_dir.path().join("a.txt")).unwrap();

        let base_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(base_dir.path()).unwrap();
        let ws = mgr
            .create(repo_dir.path(), "run-1", WorkspaceStrategy::Copy, false, "orc")
            .unwrap();
        fs::write(ws.path.join("a.txt"), "trying to overwrite a symlink\n").unwrap();

        let result = mgr.apply_to_repo(&ws);
        assert!(result.is_err());
    }

    #[test]
    fn worktree_workspace_path_is_disjoint_from_repo() {
        let repo_dir = tempfile::tempdir().unwrap();
        git_init(repo_dir.path());
        let base_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(base_dir.path()).unwrap();

        let ws = mgr
            .create(repo_dir.path(), "run-1", WorkspaceStrategy::Worktree, true, "orc")
            .unwrap();
        assert_ne!(ws.path, ws.repo_path);
        assert!(ws.path.starts_with(base_dir.path()));
    }

    #[test]
    fn cleanup_removes_worktree_and_run_dir() {
        let repo_dir = tempfile::tempdir().unwrap();
        git_init(repo_dir.path());
        let base_dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(base_dir.path()).unwrap();

        let ws = mgr
            .create(repo_dir.path(), "run-1", WorkspaceStrategy::Worktree, true, "orc")
            .unwrap();
        let run_dir = ws.run_dir.clone();
        mgr.cleanup(&ws).unwrap();
        assert!(!run_dir.exists());
    }
}
