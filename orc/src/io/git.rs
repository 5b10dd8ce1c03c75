//! Git plumbing: branches, worktrees, merges, diffs.
//!
//! Generalizes the teacher's `io/git.rs` wrapper (branch/status/commit) with
//! the worktree lifecycle, `merge --no-ff`, and ancestry checks the Workspace
//! Manager and Auto-Merge Engine need.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::io::process::run_with_timeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if out.trim() == "HEAD" {
            bail!("repository is in detached HEAD state");
        }
        Ok(out.trim().to_string())
    }

    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let out = self.run_checked(&["rev-parse", &format!("--short={len}"), "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_checked(&["status", "--porcelain"])?;
        Ok(out.lines().filter_map(parse_status_line).collect())
    }

    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let dirty: Vec<_> = self
            .status_porcelain()?
            .into_iter()
            .filter(|e| !allowed_prefixes.iter().any(|p| e.path.starts_with(p)))
            .collect();
        if !dirty.is_empty() {
            bail!(
                "working tree has unexpected changes: {}",
                dirty.iter().map(|e| e.path.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(())
    }

    pub fn ensure_clean(&self) -> Result<()> {
        self.ensure_clean_except_prefixes(&[])
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self.run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])?;
        Ok(status.status.success())
    }

    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let status = self.run(&["diff", "--cached", "--quiet"])?;
        Ok(!status.status.success())
    }

    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self.run_checked(&["rev-parse", rev])?.trim().to_string())
    }

    /// True if `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let status = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(status.status.success())
    }

    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        let outcome = self.run(&["merge", "--no-ff", "-m", message, branch])?;
        if outcome.status.success() {
            return Ok(MergeOutcome::Clean);
        }
        let unmerged = self.unmerged_paths()?;
        if unmerged.is_empty() {
            bail!(
                "git merge --no-ff failed with no unmerged paths: {}",
                outcome.stderr_string()
            );
        }
        Ok(MergeOutcome::Conflicts {
            unmerged_paths: unmerged,
            output: format!("{}{}", outcome.stdout_string(), outcome.stderr_string()),
        })
    }

    pub fn unmerged_paths(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "-m", message])?;
        Ok(())
    }

    pub fn diff(&self) -> Result<String> {
        let out = self.run(&["diff"])?;
        Ok(out.stdout_string().trim().to_string())
    }

    /// `git diff --no-index baseline workspace`; exit code 1 means "there are
    /// diffs", not an error.
    pub fn diff_no_index(baseline: &Path, workspace: &Path) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args([
            "diff",
            "--no-index",
            "--",
            &baseline.display().to_string(),
            &workspace.display().to_string(),
        ]);
        let out = run_with_timeout(cmd, None, DEFAULT_TIMEOUT, OUTPUT_LIMIT)?;
        Ok(out.stdout_string().trim().to_string())
    }

    pub fn is_repo(path: &Path) -> bool {
        let mut cmd = Command::new("git");
        cmd.args(["rev-parse", "--is-inside-work-tree"]).current_dir(path);
        match run_with_timeout(cmd, None, DEFAULT_TIMEOUT, OUTPUT_LIMIT) {
            Ok(out) => out.status.success() && out.stdout_string().trim() == "true",
            Err(_) => false,
        }
    }

    pub fn has_commit(path: &Path) -> bool {
        let mut cmd = Command::new("git");
        cmd.args(["rev-parse", "--verify", "HEAD"]).current_dir(path);
        matches!(run_with_timeout(cmd, None, DEFAULT_TIMEOUT, OUTPUT_LIMIT), Ok(out) if out.status.success())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_checked(&["worktree", "list", "--porcelain"])?;
        let mut entries = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(p) = current_path.take() {
                    entries.push(WorktreeEntry {
                        path: p,
                        branch: current_branch.take(),
                    });
                }
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch ") {
                current_branch = Some(
                    branch
                        .trim_start_matches("refs/heads/")
                        .to_string(),
                );
            }
        }
        if let Some(p) = current_path.take() {
            entries.push(WorktreeEntry {
                path: p,
                branch: current_branch.take(),
            });
        }
        Ok(entries)
    }

    /// If `branch` already exists, `git worktree add <path> <branch>`;
    /// otherwise `git worktree add -b <branch> <path>` (§4.2 worktree
    /// creation rules). Stale registrations at a dead path are pruned first.
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        for entry in self.worktree_list()? {
            if entry.branch.as_deref() == Some(branch) {
                if entry.path.is_dir() {
                    return Ok(()); // live registration: reuse (resume).
                }
                self.worktree_remove_force(&entry.path).ok();
                self.worktree_prune()?;
            }
        }

        let path_str = path.display().to_string();
        if self.branch_exists(branch)? {
            self.run_checked(&["worktree", "add", &path_str, branch])?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, &path_str])?;
        }
        Ok(())
    }

    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        self.run(&["worktree", "remove", "--force", &path.display().to_string()])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Force-delete `branch` (§4.7 `delete_branch_on_merge`). No-op if the
    /// branch is still checked out by a live worktree; call after
    /// `worktree_remove_force` for a candidate branch.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let out = self.run(args)?;
        if !out.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr_string().trim()
            );
        }
        Ok(out.stdout_string())
    }

    fn run(&self, args: &[&str]) -> Result<crate::io::process::CommandOutcome> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_with_timeout(cmd, None, DEFAULT_TIMEOUT, OUTPUT_LIMIT)
            .with_context(|| format!("run git {}", args.join(" ")))
    }
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Clean,
    Conflicts {
        unmerged_paths: Vec<String>,
        output: String,
    },
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if line.len() < 3 {
        return None;
    }
    let code = line[..2].to_string();
    let rest = line[3..].trim();
    let path = rest.split(" -> ").next_back().unwrap_or(rest).to_string();
    Some(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .expect("run git");
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        fs::write(dir.path().join("README.md"), "hello\n").expect("write");
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    #[test]
    fn current_branch_and_status() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        assert_eq!(git.current_branch().unwrap(), "main");
        assert!(git.status_porcelain().unwrap().is_empty());
        assert!(git.ensure_clean().is_ok());
    }

    #[test]
    fn checkout_new_branch_and_commit() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        git.checkout_new_branch("feature/x").unwrap();
        fs::write(dir.path().join("a.txt"), "content\n").unwrap();
        git.add_all().unwrap();
        assert!(git.commit_staged("add a.txt").unwrap());
        assert!(!git.commit_staged("noop").unwrap());
    }

    #[test]
    fn worktree_add_creates_new_branch_and_path() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        let wt_path = dir.path().join("wt1");
        git.worktree_add(&wt_path, "candidate/one").unwrap();
        assert!(wt_path.join("README.md").exists());
        let entries = git.worktree_list().unwrap();
        assert!(entries.iter().any(|e| e.branch.as_deref() == Some("candidate/one")));
    }

    #[test]
    fn worktree_add_is_idempotent_for_live_path() {
        let dir = init_repo();
        let git = Git::new(dir.path());
        let wt_path = dir.path().join("wt1");
        git.worktree_add(&wt_path, "candidate/one").unwrap();
        git.worktree_add(&wt_path, "candidate/one").unwrap();
    }

    #[test]
    fn merge_no_ff_reports_conflicts() {
        let dir = init_repo();
        let git = Git::new(dir.path());

        git.checkout_new_branch("feature/conflict").unwrap();
        fs::write(dir.path().join("README.md"), "from feature\n").unwrap();
        git.add_all().unwrap();
        git.commit_staged("feature edit").unwrap();

        git.checkout_branch("main").unwrap();
        fs::write(dir.path().join("README.md"), "from main\n").unwrap();
        git.add_all().unwrap();
        git.commit_staged("main edit").unwrap();

        let outcome = git.merge_no_ff("feature/conflict", "merge it").unwrap();
        match outcome {
            MergeOutcome::Conflicts { unmerged_paths, .. } => {
                assert_eq!(unmerged_paths, vec!["README.md".to_string()]);
            }
            MergeOutcome::Clean => panic!("expected a conflict"),
        }
    }

    #[test]
    fn merge_no_ff_clean_is_ancestor() {
        let dir = init_repo();
        let git = Git::new(dir.path());

        git.checkout_new_branch("feature/clean").unwrap();
        fs::write(dir.path().join("b.txt"), "new file\n").unwrap();
        git.add_all().unwrap();
        git.commit_staged("add b.txt").unwrap();

        git.checkout_branch("main").unwrap();
        let outcome = git.merge_no_ff("feature/clean", "merge clean").unwrap();
        assert!(matches!(outcome, MergeOutcome::Clean));
        assert!(git.is_ancestor("feature/clean", "HEAD").unwrap());
    }
}
