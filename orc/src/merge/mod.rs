//! Auto-Merge Engine (§4.7): commit on approval, merge the candidate branch
//! into the target branch, and invoke an executor to resolve conflicts.
//!
//! No direct teacher analog (the teacher never merges a worktree back); built
//! from SPEC_FULL §4.7's six-step decision tree directly on top of
//! [`crate::io::git::Git`]'s worktree/merge primitives and
//! [`crate::io::agent_client`]'s executor call for conflict resolution.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::io::agent_client::AgentClient;
use crate::io::git::{Git, MergeOutcome};
use crate::io::prompt::PromptBuilder;
use crate::model::agent_spec::{AgentCallContext, AgentSpec};
use crate::model::executor_output::ExecutorOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyMainPolicy {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Merged,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub status: MergeStatus,
    pub merge_commit_sha: Option<String>,
    pub conflict_files: Vec<String>,
    pub resolution_summary: Option<String>,
    pub error: Option<String>,
}

impl MergeReport {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: MergeStatus::Failed,
            merge_commit_sha: None,
            conflict_files: Vec::new(),
            resolution_summary: None,
            error: Some(error.into()),
        }
    }
}

/// Everything the conflict-resolution prompt (§4.4) needs beyond the
/// conflicted file list and merge output, which this engine fills in itself.
pub struct ConflictPromptContext<'a> {
    pub plan_summary: &'a str,
    pub reviewer_decisions: &'a str,
    pub candidate_rollup: &'a str,
}

/// The executor available to resolve conflicts, if any. Absent means "no
/// Family-B executor client available" (§4.7 step 5) — merge fails outright
/// on conflict instead of attempting resolution.
pub struct ConflictExecutor<'a> {
    pub spec: &'a AgentSpec,
    pub call_ctx: AgentCallContext,
    pub schema_path: &'a Path,
}

#[allow(clippy::too_many_arguments)]
pub fn merge_candidate(
    repo: &Path,
    target_branch: &str,
    candidate_branch: &str,
    merge_commit_message: &str,
    dirty_main_commit_message: &str,
    dirty_main_policy: DirtyMainPolicy,
    prompt_ctx: ConflictPromptContext,
    prompts: &PromptBuilder,
    agent_client: &dyn AgentClient,
    conflict_executor: Option<ConflictExecutor>,
) -> MergeReport {
    let git = Git::new(repo);

    if !matches!(git.branch_exists(target_branch), Ok(true)) {
        return MergeReport::failed(format!("target branch '{target_branch}' does not exist"));
    }

    if let Err(e) = settle_dirty_tree(&git, dirty_main_policy, dirty_main_commit_message) {
        return MergeReport::failed(format!("could not settle dirty tree before checkout: {e}"));
    }

    if let Err(e) = git.checkout_branch(target_branch) {
        return MergeReport::failed(format!("checkout {target_branch}: {e}"));
    }

    if let Err(e) = settle_dirty_tree(&git, dirty_main_policy, dirty_main_commit_message) {
        return MergeReport::failed(format!("could not settle dirty target branch: {e}"));
    }

    let outcome = match git.merge_no_ff(candidate_branch, merge_commit_message) {
        Ok(outcome) => outcome,
        Err(e) => return MergeReport::failed(format!("git merge --no-ff: {e}")),
    };

    match outcome {
        MergeOutcome::Clean => finalize_clean_merge(&git, candidate_branch),
        MergeOutcome::Conflicts { unmerged_paths, output } => resolve_conflicts(
            &git,
            repo,
            candidate_branch,
            merge_commit_message,
            unmerged_paths,
            output,
            prompt_ctx,
            prompts,
            agent_client,
            conflict_executor,
        ),
    }
}

fn settle_dirty_tree(git: &Git, policy: DirtyMainPolicy, commit_message: &str) -> Result<()> {
    let dirty = !git.status_porcelain()?.is_empty();
    if !dirty {
        return Ok(());
    }
    match policy {
        DirtyMainPolicy::Commit => {
            git.add_all()?;
            git.commit_staged(commit_message)?;
            Ok(())
        }
        DirtyMainPolicy::Abort => bail!("working tree has uncommitted changes and dirty_main_policy=abort"),
    }
}

fn finalize_clean_merge(git: &Git, candidate_branch: &str) -> MergeReport {
    match git.is_ancestor(candidate_branch, "HEAD") {
        Ok(true) => {}
        Ok(false) => return MergeReport::failed("merge reported clean but branch is not an ancestor of HEAD"),
        Err(e) => return MergeReport::failed(format!("ancestry check failed: {e}")),
    }
    match git.rev_parse("HEAD") {
        Ok(sha) => {
            info!(sha = %sha, "merge completed cleanly");
            MergeReport {
                status: MergeStatus::Merged,
                merge_commit_sha: Some(sha),
                conflict_files: Vec::new(),
                resolution_summary: None,
                error: None,
            }
        }
        Err(e) => MergeReport::failed(format!("rev-parse HEAD after merge: {e}")),
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_conflicts(
    git: &Git,
    repo: &Path,
    candidate_branch: &str,
    merge_commit_message: &str,
    unmerged_paths: Vec<String>,
    merge_output: String,
    prompt_ctx: ConflictPromptContext,
    prompts: &PromptBuilder,
    agent_client: &dyn AgentClient,
    conflict_executor: Option<ConflictExecutor>,
) -> MergeReport {
    let Some(executor) = conflict_executor else {
        return MergeReport {
            status: MergeStatus::Failed,
            merge_commit_sha: None,
            conflict_files: unmerged_paths,
            resolution_summary: None,
            error: Some("merge produced conflicts and no executor is available to resolve them".to_string()),
        };
    };

    let status_excerpt = git
        .status_porcelain()
        .map(|entries| entries.iter().map(|e| format!("{} {}", e.code, e.path)).collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();
    let truncated_output: String = merge_output.chars().take(4000).collect();

    let prompt = match prompts.build_conflict_resolution(
        prompt_ctx.plan_summary,
        prompt_ctx.reviewer_decisions,
        prompt_ctx.candidate_rollup,
        &status_excerpt,
        &truncated_output,
        &unmerged_paths,
        merge_commit_message,
    ) {
        Ok(pack) => pack,
        Err(e) => {
            return MergeReport {
                status: MergeStatus::Failed,
                merge_commit_sha: None,
                conflict_files: unmerged_paths,
                resolution_summary: None,
                error: Some(format!("building conflict-resolution prompt: {e}")),
            };
        }
    };

    let call_result = agent_client.call(
        executor.spec,
        &executor.call_ctx,
        &prompt.render(),
        executor.schema_path,
        "merge_conflict",
    );

    let outcome = match call_result {
        Ok(outcome) => outcome,
        Err(e) => {
            return MergeReport {
                status: MergeStatus::Failed,
                merge_commit_sha: None,
                conflict_files: unmerged_paths,
                resolution_summary: None,
                error: Some(format!("conflict-resolution executor call failed: {e}")),
            };
        }
    };

    let executor_output = ExecutorOutput::from_payload(&outcome.payload, &outcome.raw_text);
    let resolution_summary = executor_output.summary().to_string();
    if !matches!(executor_output, ExecutorOutput::Done { .. }) {
        return MergeReport {
            status: MergeStatus::Failed,
            merge_commit_sha: None,
            conflict_files: unmerged_paths,
            resolution_summary: Some(resolution_summary),
            error: Some("conflict-resolution executor did not return DONE".to_string()),
        };
    }

    let remaining = match git.unmerged_paths() {
        Ok(p) => p,
        Err(e) => return MergeReport::failed(format!("checking remaining unmerged paths: {e}")),
    };
    if !remaining.is_empty() {
        return MergeReport {
            status: MergeStatus::Failed,
            merge_commit_sha: None,
            conflict_files: remaining,
            resolution_summary: Some(resolution_summary),
            error: Some("conflicted files remain after executor resolution".to_string()),
        };
    }

    if merge_in_progress(repo) {
        if let Err(e) = git.commit(merge_commit_message) {
            return MergeReport::failed(format!("committing resolved merge: {e}"));
        }
    }

    let mut report = finalize_clean_merge(git, candidate_branch);
    report.resolution_summary = Some(resolution_summary);
    if report.status == MergeStatus::Failed {
        warn!("conflict resolution appeared to succeed but ancestry/sha check failed");
    }
    report
}

fn merge_in_progress(repo: &Path) -> bool {
    repo.join(".git").join("MERGE_HEAD").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::agent_client::AgentCallOutcome;
    use crate::model::agent_spec::{AgentFamily, AgentRole};
    use serde_json::json;
    use std::process::Command;
    use std::time::Duration;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q", "-b", "main"]);
        run_git(dir.path(), &["config", "user.email", "t@example.com"]);
        run_git(dir.path(), &["config", "user.name", "T"]);
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    struct NullAgentClient;
    impl AgentClient for NullAgentClient {
        fn call(
            &self,
            _spec: &AgentSpec,
            _ctx: &AgentCallContext,
            _prompt: &str,
            _schema_path: &Path,
            _phase: &str,
        ) -> Result<AgentCallOutcome> {
            unreachable!("clean merges never invoke the conflict executor")
        }
    }

    struct DoneAgentClient;
    impl AgentClient for DoneAgentClient {
        fn call(
            &self,
            _spec: &AgentSpec,
            _ctx: &AgentCallContext,
            _prompt: &str,
            _schema_path: &Path,
            _phase: &str,
        ) -> Result<AgentCallOutcome> {
            std::fs::write(_ctx.workdir.join("a.txt"), "resolved\n").unwrap();
            run_git(&_ctx.workdir, &["add", "-A"]);
            Ok(AgentCallOutcome {
                payload: json!({"status": "DONE", "summary": "resolved the conflict"}),
                raw_text: String::new(),
                exit_code: 0,
            })
        }
    }

    fn executor_spec() -> AgentSpec {
        AgentSpec {
            id: "executor-1".to_string(),
            family: AgentFamily::B,
            role: AgentRole::Executor,
            command: None,
            model: None,
            reasoning_effort: None,
            verbosity: None,
            max_turns: None,
            allowed_tools: None,
            turn_budget: None,
        }
    }

    #[test]
    fn clean_merge_records_commit_sha() {
        let dir = init_repo();
        run_git(dir.path(), &["checkout", "-b", "candidate/one"]);
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "add b"]);
        run_git(dir.path(), &["checkout", "main"]);

        let prompts = PromptBuilder::new(10_000);
        let report = merge_candidate(
            dir.path(),
            "main",
            "candidate/one",
            "merge it",
            "snapshot dirty main",
            DirtyMainPolicy::Abort,
            ConflictPromptContext {
                plan_summary: "",
                reviewer_decisions: "",
                candidate_rollup: "",
            },
            &prompts,
            &NullAgentClient,
            None,
        );

        assert_eq!(report.status, MergeStatus::Merged);
        assert!(report.merge_commit_sha.is_some());
        assert!(report.error.is_none());
    }

    #[test]
    fn conflict_without_executor_fails() {
        let dir = init_repo();
        run_git(dir.path(), &["checkout", "-b", "candidate/conflict"]);
        std::fs::write(dir.path().join("a.txt"), "from candidate\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "candidate edit"]);
        run_git(dir.path(), &["checkout", "main"]);
        std::fs::write(dir.path().join("a.txt"), "from main\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "main edit"]);

        let prompts = PromptBuilder::new(10_000);
        let report = merge_candidate(
            dir.path(),
            "main",
            "candidate/conflict",
            "merge it",
            "snapshot dirty main",
            DirtyMainPolicy::Abort,
            ConflictPromptContext {
                plan_summary: "",
                reviewer_decisions: "",
                candidate_rollup: "",
            },
            &prompts,
            &NullAgentClient,
            None,
        );

        assert_eq!(report.status, MergeStatus::Failed);
        assert_eq!(report.conflict_files, vec!["a.txt".to_string()]);
        // Abort the merge left in progress by the failed attempt so the repo
        // is clean for the next test in this process.
        run_git(dir.path(), &["merge", "--abort"]);
    }

    #[test]
    fn conflict_resolved_by_executor_commits_and_verifies_ancestry() {
        let dir = init_repo();
        run_git(dir.path(), &["checkout", "-b", "candidate/conflict"]);
        std::fs::write(dir.path().join("a.txt"), "from candidate\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "candidate edit"]);
        run_git(dir.path(), &["checkout", "main"]);
        std::fs::write(dir.path().join("a.txt"), "from main\n").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "-m", "main edit"]);

        let prompts = PromptBuilder::new(10_000);
        let spec = executor_spec();
        let executor = ConflictExecutor {
            spec: &spec,
            call_ctx: AgentCallContext {
                workdir: dir.path().to_path_buf(),
                log_path: dir.path().join("executor_family.log"),
                timeout: Duration::from_secs(30),
                output_limit_bytes: 65_536,
                stream_path: None,
                resume_session_id: None,
            },
            schema_path: Path::new("unused.json"),
        };

        let report = merge_candidate(
            dir.path(),
            "main",
            "candidate/conflict",
            "merge it",
            "snapshot dirty main",
            DirtyMainPolicy::Abort,
            ConflictPromptContext {
                plan_summary: "plan",
                reviewer_decisions: "decisions",
                candidate_rollup: "rollup",
            },
            &prompts,
            &DoneAgentClient,
            Some(executor),
        );

        assert_eq!(report.status, MergeStatus::Merged);
        assert!(report.merge_commit_sha.is_some());
        assert_eq!(report.resolution_summary.as_deref(), Some("resolved the conflict"));
    }
}
