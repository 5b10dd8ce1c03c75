//! Per-iteration algorithm (§4.6): plan → assign → execute → review →
//! consensus, looping until a reviewer consensus (or admin override) approves
//! a candidate or the iteration cap is reached.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::warn;

use crate::config::{AssignmentMode, CleanupPolicy, WorkspaceStrategyConfig};
use crate::core::validate::{parse_decision, parse_plan};
use crate::io::git::Git;
use crate::model::candidate::{Candidate, CandidateStatus};
use crate::model::executor_output::ExecutorOutput;
use crate::model::plan::{Plan, TestCommandSpec};
use crate::model::decision::ReviewerDecision;
use crate::model::run::{QnaEntry, Run, Stage};
use crate::model::workspace::{Workspace, WorkspaceStrategy};
use crate::model::AgentSpec;
use crate::merge::{self, ConflictExecutor, ConflictPromptContext, DirtyMainPolicy as MergeDirtyMainPolicy};

use super::{fan_out, Controller};

/// What one full run (possibly several iterations) ended with.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Approved,
    Failed(String),
}

/// What one iteration of the plan→execute→review loop produced.
enum StepResult {
    NextIteration {
        next_task: String,
        carry_forward: Option<PathBuf>,
    },
    Done,
    Failed(String),
}

enum IterationCapChoice {
    AcceptPartial,
    Extend(u32),
}

/// What one reviewer's plan call produced: a usable plan, or the shape
/// violations that made it unusable (§7: "Record under `plan_errors`").
enum PlanOutcome {
    Ok(Plan),
    Invalid(Vec<String>),
}

/// What one reviewer's review call produced: a usable decision, or the shape
/// violations that made it unusable (§7: "Record under ... `review_errors`").
enum DecisionOutcome {
    Ok(ReviewerDecision),
    Invalid(Vec<String>),
}

/// One executed candidate plus everything downstream phases need about it.
/// `model::Candidate` alone only carries a `workspace_path`, not the full
/// `Workspace` descriptor (branch name, strategy, baseline) or the `Plan`/
/// `AgentSpec` it was produced from.
struct CandidateEntry {
    candidate: Candidate,
    workspace: Workspace,
    plan: Plan,
    executor: AgentSpec,
}

impl CandidateEntry {
    fn plan_prompt(&self) -> String {
        match &self.plan {
            Plan::Ok { claude_prompt, .. } => claude_prompt.clone(),
            Plan::NeedsUserInput { .. } => String::new(),
        }
    }
}

fn render_template(template: &str, run: &Run, branch: &str, merge_target_branch: &str) -> String {
    template
        .replace("{task}", &run.task)
        .replace("{run_id}", &run.run_id)
        .replace("{branch}", branch)
        .replace("{merge_target_branch}", merge_target_branch)
}

impl<'a> Controller<'a> {
    /// Drive the run to completion: resolve the initial task, then loop
    /// iterations until a candidate is approved or the run fails outright.
    pub fn run(&self, initial_task: Option<String>) -> Result<RunOutcome> {
        let mut task = self.ensure_task(initial_task)?;
        let mut carry_forward_source: Option<PathBuf> = None;
        let mut extended_cap: Option<u32> = None;

        loop {
            let run = self.run_state.get();
            let cap = extended_cap.or(self.config.orchestrator.max_iterations);
            if let Some(cap) = cap
                && run.iteration > cap
            {
                match self.escalate_iteration_cap(cap)? {
                    IterationCapChoice::AcceptPartial => {
                        self.run_state.update(|r| {
                            r.approved_by_admin = true;
                            r.approved = true;
                            r.stage = Stage::Complete;
                            r.run_status = crate::model::run::RunStatus::Idle;
                        })?;
                        return Ok(RunOutcome::Approved);
                    }
                    IterationCapChoice::Extend(by) => {
                        extended_cap = Some(cap + by);
                        continue;
                    }
                }
            }

            match self.run_single_iteration(&task, carry_forward_source.as_deref())? {
                StepResult::NextIteration { next_task, carry_forward } => {
                    task = next_task;
                    carry_forward_source = carry_forward;
                    continue;
                }
                StepResult::Done => return Ok(RunOutcome::Approved),
                StepResult::Failed(reason) => {
                    self.run_state.update(|r| r.stage = Stage::Failed)?;
                    return Ok(RunOutcome::Failed(reason));
                }
            }
        }
    }

    fn ensure_task(&self, initial_task: Option<String>) -> Result<String> {
        let run = self.run_state.get();
        if !run.task.is_empty() {
            return Ok(run.task);
        }

        let task = match initial_task {
            Some(task) => task,
            None => {
                self.run_state.update(|r| r.stage = Stage::AwaitingInitialTask)?;
                self.with_telegram(|tg| self.broker.ask_initial_task(&self.run_state, self.broker_timeout(), tg))?
            }
        };

        self.run_state.update(|r| {
            r.task = task.clone();
            r.stage = Stage::Planning;
        })?;
        Ok(task)
    }

    fn run_single_iteration(&self, task: &str, carry_forward_source: Option<&Path>) -> Result<StepResult> {
        let run = self.run_state.update(|r| r.stage = Stage::Planning)?;
        self.run_state.append_history(&format!("iteration {} planning", run.iteration))?;

        let (plans, plan_errors) = self.plan_phase(task, &run.user_qna)?;
        self.run_state.update(|r| r.plan_errors = plan_errors.clone())?;
        if plans.is_empty() {
            return self.escalate_plan_failure(task, &plan_errors);
        }
        self.run_state.update(|r| r.stage = Stage::PlanReady)?;

        let assignments = self.assign_candidates(&plans);
        self.run_state.update(|r| r.stage = Stage::Executing)?;

        let strategy = self.resolve_workspace_strategy(assignments.len());
        let source = if self.config.orchestrator.carry_forward_workspace_between_iterations {
            carry_forward_source.unwrap_or(&self.repo)
        } else {
            &self.repo
        };

        let entries = self.execute_phase(&run, assignments, strategy, source)?;
        if entries.is_empty() {
            return Ok(StepResult::Failed("no candidate completed execution".to_string()));
        }
        self.run_state.update(|r| r.stage = Stage::TestsReady)?;
        self.run_state.update(|r| r.stage = Stage::Reviewing)?;

        let (decisions, review_errors) = self.review_phase(&entries)?;
        self.run_state.update(|r| r.review_errors = review_errors.clone())?;
        if decisions.is_empty() {
            return self.escalate_review_failure(task, &entries, &review_errors);
        }
        self.run_state.update(|r| r.stage = Stage::ReviewReady)?;

        let consensus_result = crate::core::consensus::consensus(&decisions);
        let (status, winner, next_prompt) = if consensus_result.consensus {
            (
                consensus_result.status.unwrap_or_default(),
                consensus_result.winner,
                consensus_result.next_prompt,
            )
        } else {
            self.admin_consensus_decision(&decisions)?
        };

        match status.as_str() {
            "APPROVED" => {
                let winner_id = winner.ok_or_else(|| anyhow::anyhow!("approved decision has no winner"))?;
                let winning = entries
                    .iter()
                    .find(|e| e.candidate.id == winner_id)
                    .ok_or_else(|| anyhow::anyhow!("winning candidate '{winner_id}' not found among entries"))?;

                self.handoff(winning, &decisions)?;
                self.promote(winning)?;

                let losers: Vec<CandidateEntry> = entries
                    .into_iter()
                    .filter(|e| e.candidate.id != winner_id)
                    .collect();
                self.cleanup_entries(&losers);

                self.run_state.update(|r| {
                    r.approved = true;
                    r.persisted = true;
                    r.stage = Stage::Complete;
                    r.run_status = crate::model::run::RunStatus::Idle;
                })?;
                Ok(StepResult::Done)
            }
            "REJECTED" => {
                let carry_forward = if self.config.orchestrator.carry_forward_workspace_between_iterations {
                    winner
                        .as_ref()
                        .and_then(|id| entries.iter().find(|e| &e.candidate.id == id))
                        .map(|e| e.workspace.path.clone())
                } else {
                    None
                };
                self.cleanup_entries(&entries);

                let next_task = next_prompt.unwrap_or_else(|| task.to_string());
                self.run_state.update(|r| {
                    r.iteration += 1;
                    r.task = next_task.clone();
                    r.stage = Stage::Planning;
                })?;
                Ok(StepResult::NextIteration {
                    next_task,
                    carry_forward,
                })
            }
            other => Ok(StepResult::Failed(format!("unexpected consensus status '{other}'"))),
        }
    }

    fn plan_phase(&self, task: &str, user_qna: &[QnaEntry]) -> Result<(Vec<(AgentSpec, Plan)>, Vec<String>)> {
        let results = fan_out(&self.reviewers, |reviewer| self.plan_for_reviewer(reviewer, task, user_qna));
        let mut plans = Vec::new();
        let mut errors = Vec::new();
        for (reviewer, result) in self.reviewers.iter().zip(results) {
            match result {
                Ok(PlanOutcome::Ok(plan)) => plans.push((reviewer.clone(), plan)),
                Ok(PlanOutcome::Invalid(reasons)) => {
                    warn!(reviewer = %reviewer.id, errors = ?reasons, "reviewer produced no usable plan");
                    errors.push(format!("{}: {}", reviewer.id, reasons.join("; ")));
                }
                Err(e) => {
                    warn!(reviewer = %reviewer.id, err = %e, "plan call failed");
                    errors.push(format!("{}: {e}", reviewer.id));
                }
            }
        }
        Ok((plans, errors))
    }

    fn plan_for_reviewer(&self, reviewer: &AgentSpec, task: &str, user_qna: &[QnaEntry]) -> Result<PlanOutcome> {
        let mut qna: Vec<QnaEntry> = user_qna.to_vec();
        let ctx = self.call_ctx(&self.repo, &format!("plan-{}", reviewer.id));

        for _ in 0..self.config.orchestrator.max_claude_question_rounds {
            let prompt = self.prompts.build_plan(task, &qna)?;
            let outcome = self.agent_client.call(reviewer, &ctx, &prompt.render(), &self.plan_schema, "plan")?;
            let plan = match parse_plan(&outcome.payload) {
                Ok(plan) => plan,
                Err(errors) => {
                    warn!(reviewer = %reviewer.id, errors = ?errors, "plan payload failed validation");
                    return Ok(PlanOutcome::Invalid(errors));
                }
            };

            match plan {
                Plan::Ok { .. } => return Ok(PlanOutcome::Ok(plan)),
                Plan::NeedsUserInput { questions } => {
                    let answers = self.with_telegram(|tg| {
                        self.broker.ask_user_input(&self.run_state, questions.clone(), self.broker_timeout(), tg)
                    })?;
                    for (question, answer) in questions.into_iter().zip(answers) {
                        qna.push(QnaEntry { question, answer });
                    }
                    self.run_state.update(|r| r.user_qna = qna.clone())?;
                }
            }
        }
        Ok(PlanOutcome::Invalid(vec![format!(
            "reviewer exhausted {} clarification rounds without an OK plan",
            self.config.orchestrator.max_claude_question_rounds
        )]))
    }

    /// §4.6 point 1: when every reviewer's plan is invalid, escalate to an
    /// admin decision instead of failing the run; the admin's notes (if any)
    /// seed the next iteration's task, which is otherwise retried unchanged.
    fn escalate_plan_failure(&self, task: &str, plan_errors: &[String]) -> Result<StepResult> {
        self.run_state
            .append_history("all reviewer plans were invalid, escalating to admin")?;

        let options = if plan_errors.is_empty() {
            vec!["retry with the same task".to_string()]
        } else {
            plan_errors.to_vec()
        };
        self.notify_telegram(&format!(
            "All reviewer plans were invalid this iteration:\n{}",
            options.join("\n")
        ));

        let (_choice, notes) = self.with_telegram(|tg| {
            self.broker.ask_admin_decision(&self.run_state, options, self.broker_timeout(), tg)
        })?;
        self.run_state.update(|r| r.approved_by_admin = true)?;

        let next_task = notes.unwrap_or_else(|| task.to_string());
        self.run_state.update(|r| {
            r.iteration += 1;
            r.task = next_task.clone();
            r.stage = Stage::Planning;
        })?;
        Ok(StepResult::NextIteration {
            next_task,
            carry_forward: None,
        })
    }

    fn assign_candidates(&self, plans: &[(AgentSpec, Plan)]) -> Vec<(AgentSpec, Plan, AgentSpec, u32)> {
        let assignment = &self.config.agents.assignment;
        let per_plan = match assignment.mode {
            AssignmentMode::AllExecutorsPerPlan => self.executors.len().max(1) as u32,
            AssignmentMode::RoundRobin => assignment.executors_per_plan.max(1),
        };

        let mut assignments = Vec::new();
        let mut cursor = 0usize;
        for (reviewer, plan) in plans {
            for k in 1..=per_plan {
                let executor = self.executors[cursor % self.executors.len()].clone();
                cursor += 1;
                assignments.push((reviewer.clone(), plan.clone(), executor, k));
            }
        }
        assignments
    }

    fn resolve_workspace_strategy(&self, total_candidates: usize) -> WorkspaceStrategy {
        let configured = match self.config.orchestrator.workspace_strategy {
            WorkspaceStrategyConfig::Auto => WorkspaceStrategy::Auto,
            WorkspaceStrategyConfig::Worktree => WorkspaceStrategy::Worktree,
            WorkspaceStrategyConfig::Copy => WorkspaceStrategy::Copy,
            WorkspaceStrategyConfig::InPlace => WorkspaceStrategy::InPlace,
        };
        if configured == WorkspaceStrategy::InPlace && total_candidates > 1 {
            warn!("in_place workspace strategy cannot serve multiple concurrent candidates, forcing copy");
            return WorkspaceStrategy::Copy;
        }
        configured
    }

    fn execute_phase(
        &self,
        run: &Run,
        assignments: Vec<(AgentSpec, Plan, AgentSpec, u32)>,
        strategy: WorkspaceStrategy,
        source: &Path,
    ) -> Result<Vec<CandidateEntry>> {
        let strategy = if self.config.orchestrator.carry_forward_workspace_between_iterations
            && source != self.repo.as_path()
        {
            WorkspaceStrategy::Copy
        } else {
            strategy
        };

        let results = fan_out(&assignments, |(reviewer, plan, executor, k)| {
            self.execute_one(run, reviewer, plan, executor, *k, strategy, source)
        });

        let mut entries = Vec::new();
        for ((reviewer, _, executor, k), result) in assignments.iter().zip(results) {
            match result {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => warn!(reviewer = %reviewer.id, executor = %executor.id, k, "candidate produced no entry"),
                Err(e) => warn!(reviewer = %reviewer.id, executor = %executor.id, k, err = %e, "execute call failed"),
            }
        }
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_one(
        &self,
        run: &Run,
        reviewer: &AgentSpec,
        plan: &Plan,
        executor: &AgentSpec,
        k: u32,
        strategy: WorkspaceStrategy,
        source: &Path,
    ) -> Result<Option<CandidateEntry>> {
        let candidate_id = format!("iter{}-{}-{}-{}", run.iteration, reviewer.id, executor.id, k);
        let cfg = &self.config.orchestrator;
        let workspace = self.workspaces.create_candidate(
            &self.repo,
            source,
            &run.run_id,
            run.iteration,
            &candidate_id,
            strategy,
            cfg.use_git_worktree,
            &cfg.branch_prefix,
            cfg.branch_suffix_length,
        )?;

        let mut candidate = Candidate::new(run.iteration, &reviewer.id, &executor.id, k, workspace.path.clone());
        let ctx = self.call_ctx(&workspace.path, &format!("execute-{candidate_id}"));

        let mut reviewer_notes: Option<String> = None;
        let mut summary: Option<String> = None;

        for _ in 0..cfg.max_claude_question_rounds {
            let prompt = self.prompts.build_execute(plan, reviewer_notes.as_deref())?;
            let outcome =
                self.agent_client
                    .call(executor, &ctx, &prompt.render(), &self.executor_output_schema, "execute")?;
            let output = ExecutorOutput::from_payload(&outcome.payload, &outcome.raw_text);

            match output {
                ExecutorOutput::Done { summary: s } => {
                    summary = Some(s);
                    break;
                }
                ExecutorOutput::Failed { summary: s } => {
                    candidate.status = CandidateStatus::Failed;
                    candidate.executor_summary = Some(s);
                    return Ok(Some(CandidateEntry {
                        candidate,
                        workspace,
                        plan: plan.clone(),
                        executor: executor.clone(),
                    }));
                }
                ExecutorOutput::NeedsReviewer { questions } => {
                    reviewer_notes = Some(self.reviewer_feedback_round(&questions)?);
                }
            }
        }

        let Some(summary) = summary else {
            candidate.status = CandidateStatus::Failed;
            candidate.executor_summary =
                Some(format!("executor exhausted {} clarification rounds without a result", cfg.max_claude_question_rounds));
            return Ok(Some(CandidateEntry {
                candidate,
                workspace,
                plan: plan.clone(),
                executor: executor.clone(),
            }));
        };

        candidate.executor_summary = Some(summary);
        let test_results = self
            .test_runner
            .run_tests(&workspace.path, &self.test_run_config(), plan_test_commands(plan))?;
        candidate.test_results = Some(test_results);

        let diff = self.workspaces.get_diff(&workspace)?;
        candidate.diff_preview = Some(Candidate::compute_diff_preview(&diff));
        candidate.diff = Some(diff);
        candidate.status = CandidateStatus::Done;

        Ok(Some(CandidateEntry {
            candidate,
            workspace,
            plan: plan.clone(),
            executor: executor.clone(),
        }))
    }

    /// §4.6 point 3: ask *every* reviewer (in order) to answer the executor's
    /// questions and concatenate their answers into one continuation prompt.
    fn reviewer_feedback_round(&self, questions: &[String]) -> Result<String> {
        let results = fan_out(&self.reviewers, |reviewer| {
            let ctx = self.call_ctx(&self.repo, &format!("reviewer-feedback-{}", reviewer.id));
            let prompt = self.prompts.build_reviewer_feedback(questions)?;
            self.agent_client
                .call(reviewer, &ctx, &prompt.render(), &self.text_response_schema, "reviewer_feedback")
        });

        let mut answers = Vec::new();
        for (reviewer, result) in self.reviewers.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let text = outcome
                        .payload
                        .get("text")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or(outcome.raw_text);
                    answers.push(format!("{}: {}", reviewer.id, text));
                }
                Err(e) => warn!(reviewer = %reviewer.id, err = %e, "reviewer feedback call failed"),
            }
        }
        Ok(answers.join("\n\n"))
    }

    fn review_phase(&self, entries: &[CandidateEntry]) -> Result<(Vec<ReviewerDecision>, Vec<String>)> {
        let candidates: Vec<Candidate> = entries.iter().map(|e| e.candidate.clone()).collect();
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();

        let results = fan_out(&self.reviewers, |reviewer| {
            self.review_for_reviewer(reviewer, &candidates, &candidate_ids)
        });

        let mut decisions = Vec::new();
        let mut errors = Vec::new();
        for (reviewer, result) in self.reviewers.iter().zip(results) {
            match result {
                Ok(DecisionOutcome::Ok(decision)) => decisions.push(decision),
                Ok(DecisionOutcome::Invalid(reasons)) => {
                    warn!(reviewer = %reviewer.id, errors = ?reasons, "reviewer produced no usable decision");
                    errors.push(format!("{}: {}", reviewer.id, reasons.join("; ")));
                }
                Err(e) => {
                    warn!(reviewer = %reviewer.id, err = %e, "review call failed");
                    errors.push(format!("{}: {e}", reviewer.id));
                }
            }
        }
        Ok((decisions, errors))
    }

    fn review_for_reviewer(
        &self,
        reviewer: &AgentSpec,
        candidates: &[Candidate],
        candidate_ids: &[String],
    ) -> Result<DecisionOutcome> {
        let mut qna: Vec<QnaEntry> = Vec::new();
        let ctx = self.call_ctx(&self.repo, &format!("review-{}", reviewer.id));

        for _ in 0..self.config.orchestrator.max_claude_question_rounds {
            let mut body = self.prompts.build_review_candidates(candidates)?.render();
            if !qna.is_empty() {
                body.push_str("\n\n## Prior clarification\n");
                for entry in &qna {
                    body.push_str(&format!("Q: {}\nA: {}\n", entry.question, entry.answer));
                }
            }

            let outcome = self.agent_client.call(reviewer, &ctx, &body, &self.decision_schema, "review")?;
            let decision = match parse_decision(&outcome.payload, candidate_ids) {
                Ok(decision) => decision,
                Err(errors) => {
                    warn!(reviewer = %reviewer.id, errors = ?errors, "decision payload failed validation");
                    return Ok(DecisionOutcome::Invalid(errors));
                }
            };

            match decision {
                ReviewerDecision::NeedsUserInput { questions } => {
                    let answers = self.with_telegram(|tg| {
                        self.broker.ask_user_input(&self.run_state, questions.clone(), self.broker_timeout(), tg)
                    })?;
                    for (question, answer) in questions.into_iter().zip(answers) {
                        qna.push(QnaEntry { question, answer });
                    }
                }
                decided => return Ok(DecisionOutcome::Ok(decided)),
            }
        }
        Ok(DecisionOutcome::Invalid(vec![format!(
            "reviewer exhausted {} clarification rounds without a decision",
            self.config.orchestrator.max_claude_question_rounds
        )]))
    }

    /// §4.6 point 4: when zero reviewer decisions validate, escalate to an
    /// admin decision over the candidates themselves (choose one to seed a
    /// retry), mark this iteration REJECTED, and continue.
    fn escalate_review_failure(
        &self,
        task: &str,
        entries: &[CandidateEntry],
        review_errors: &[String],
    ) -> Result<StepResult> {
        self.run_state
            .append_history("no reviewer produced a usable decision, escalating to admin")?;

        let options: Vec<String> = entries
            .iter()
            .map(|e| format!("{}: {}", e.candidate.id, e.candidate.executor_summary.clone().unwrap_or_default()))
            .collect();
        self.notify_telegram(&format!(
            "All reviewer decisions were invalid this iteration:\n{}",
            review_errors.join("\n")
        ));

        let (choice, notes) = self.with_telegram(|tg| {
            self.broker.ask_admin_decision(&self.run_state, options, self.broker_timeout(), tg)
        })?;
        self.run_state.update(|r| r.approved_by_admin = true)?;

        let chosen = usize::try_from(choice).ok().filter(|&i| i < entries.len()).map(|i| &entries[i]);
        let carry_forward = if self.config.orchestrator.carry_forward_workspace_between_iterations {
            chosen.map(|e| e.workspace.path.clone())
        } else {
            None
        };

        self.cleanup_entries(entries);

        let next_task = notes.unwrap_or_else(|| task.to_string());
        self.run_state.update(|r| {
            r.iteration += 1;
            r.task = next_task.clone();
            r.stage = Stage::Planning;
        })?;
        Ok(StepResult::NextIteration {
            next_task,
            carry_forward,
        })
    }

    fn admin_consensus_decision(
        &self,
        decisions: &[ReviewerDecision],
    ) -> Result<(String, Option<String>, Option<String>)> {
        let options: Vec<String> = decisions
            .iter()
            .map(|d| match d {
                ReviewerDecision::Approved { winner_candidate_id, summary, .. } => {
                    format!("APPROVED {winner_candidate_id}: {summary}")
                }
                ReviewerDecision::Rejected { winner_candidate_id, summary, next_prompt, .. } => {
                    format!("REJECTED {winner_candidate_id}: {summary} (next: {next_prompt})")
                }
                ReviewerDecision::NeedsUserInput { questions } => {
                    format!("NEEDS_USER_INPUT: {}", questions.join("; "))
                }
            })
            .collect();

        let (choice, _notes) = self.with_telegram(|tg| {
            self.broker.ask_admin_decision(&self.run_state, options.clone(), self.broker_timeout(), tg)
        })?;
        let idx = usize::try_from(choice).ok().filter(|&i| i < decisions.len()).ok_or_else(|| {
            anyhow::anyhow!("admin decision choice {choice} out of range for {} decisions", decisions.len())
        })?;
        self.run_state.update(|r| r.approved_by_admin = true)?;

        let decided = &decisions[idx];
        Ok((
            decided.status_label().to_string(),
            decided.winner_candidate_id().map(str::to_string),
            decided.next_prompt().map(str::to_string),
        ))
    }

    /// §4.6 "Handoff": reruns each reviewer in HANDOFF mode on the winning
    /// candidate, persists the resulting admin-facing summaries to
    /// `Run.handoff_summary`, and sends them over Telegram when enabled.
    fn handoff(&self, winning: &CandidateEntry, decisions: &[ReviewerDecision]) -> Result<()> {
        let summary = winning.candidate.executor_summary.clone().unwrap_or_default();
        let _ = decisions;

        let results = fan_out(&self.reviewers, |reviewer| {
            let ctx = self.call_ctx(&self.repo, &format!("handoff-{}", reviewer.id));
            let prompt = self.prompts.build_handoff(&summary, &self.run_state.get().task)?;
            self.agent_client
                .call(reviewer, &ctx, &prompt.render(), &self.text_response_schema, "handoff")
        });

        let mut summaries = Vec::new();
        for (reviewer, result) in self.reviewers.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let text = outcome
                        .payload
                        .get("text")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or(outcome.raw_text);
                    summaries.push(format!("{}: {}", reviewer.id, text));
                }
                Err(e) => warn!(reviewer = %reviewer.id, err = %e, "handoff acknowledgement call failed"),
            }
        }

        if !summaries.is_empty() {
            let combined = summaries.join("\n\n");
            self.run_state.update(|r| r.handoff_summary = Some(combined.clone()))?;
            self.notify_telegram(&format!("Handoff summary:\n{combined}"));
        }
        Ok(())
    }

    fn promote(&self, winning: &CandidateEntry) -> Result<()> {
        let cfg = &self.config.orchestrator;
        let run = self.run_state.get();

        if cfg.auto_merge_on_approval {
            self.run_state.update(|r| r.stage = Stage::Merging)?;
            let candidate_branch = winning
                .workspace
                .branch_name
                .clone()
                .ok_or_else(|| anyhow::anyhow!("auto_merge_on_approval requires a worktree-backed candidate"))?;

            let merge_commit_message =
                render_template(&cfg.merge_commit_message, &run, &candidate_branch, &cfg.merge_target_branch);
            let dirty_main_commit_message =
                render_template(&cfg.dirty_main_commit_message, &run, &candidate_branch, &cfg.merge_target_branch);
            let dirty_policy = match cfg.dirty_main_policy {
                crate::config::DirtyMainPolicy::Commit => MergeDirtyMainPolicy::Commit,
                crate::config::DirtyMainPolicy::Abort => MergeDirtyMainPolicy::Abort,
            };

            let conflict_executor = self.executors.first().map(|spec| ConflictExecutor {
                spec,
                call_ctx: self.call_ctx(&self.repo, "merge_conflict"),
                schema_path: self.executor_output_schema.as_path(),
            });

            let report = merge::merge_candidate(
                &self.repo,
                &cfg.merge_target_branch,
                &candidate_branch,
                &merge_commit_message,
                &dirty_main_commit_message,
                dirty_policy,
                ConflictPromptContext {
                    plan_summary: &winning.plan_prompt(),
                    reviewer_decisions: "",
                    candidate_rollup: winning.candidate.executor_summary.as_deref().unwrap_or(""),
                },
                &self.prompts,
                self.agent_client,
                conflict_executor,
            );

            self.run_state.update(|r| {
                r.merge_status = Some(match report.status {
                    merge::MergeStatus::Merged => "merged".to_string(),
                    merge::MergeStatus::Failed => "failed".to_string(),
                });
                r.merge_commit_sha = report.merge_commit_sha.clone();
                r.merge_conflict_files = report.conflict_files.clone();
                r.merge_resolution_summary = report.resolution_summary.clone();
                r.merge_error = report.error.clone();
            })?;

            if report.status == merge::MergeStatus::Failed {
                bail!(report.error.unwrap_or_else(|| "merge failed".to_string()));
            }

            if cfg.delete_branch_on_merge {
                Git::new(&self.repo).delete_branch(&candidate_branch)?;
            }
            if cfg.delete_worktree_on_merge {
                self.workspaces.cleanup(&winning.workspace)?;
            }
            return Ok(());
        }

        if cfg.apply_changes_on_success {
            self.workspaces.apply_to_repo(&winning.workspace)?;
            if cfg.commit_on_approval {
                let message = render_template(&cfg.commit_message, &run, "", &cfg.merge_target_branch);
                self.workspaces.commit_changes(&winning.workspace, &message)?;
            }
        }

        if matches!(cfg.cleanup, CleanupPolicy::Always | CleanupPolicy::OnSuccess) {
            self.workspaces.cleanup(&winning.workspace)?;
        }
        Ok(())
    }

    fn cleanup_entries(&self, entries: &[CandidateEntry]) {
        for entry in entries {
            if let Err(e) = self.workspaces.cleanup(&entry.workspace) {
                warn!(candidate = %entry.candidate.id, err = %e, "failed to clean up candidate workspace");
            }
        }
    }

    fn escalate_iteration_cap(&self, cap: u32) -> Result<IterationCapChoice> {
        let run = self.run_state.get();
        let request_id = uuid::Uuid::new_v4().to_string();
        let missing_work_summary = format!(
            "iteration {} exceeds the configured cap of {cap} without reviewer consensus to approve a candidate",
            run.iteration
        );
        let extend_by = cap.max(1);
        let prompt = self
            .prompts
            .build_iteration_cap(run.iteration, cap, &missing_work_summary, extend_by, &request_id)?;
        self.run_state
            .append_history(&format!("iteration cap {cap} reached, escalating to admin"))?;
        self.notify_telegram(&prompt.render());

        let options = vec!["accept_partial".to_string(), format!("extend_by_{extend_by}")];
        let (choice, _notes) = self.with_telegram(|tg| {
            self.broker.ask_admin_decision(&self.run_state, options, self.broker_timeout(), tg)
        })?;
        self.run_state.update(|r| r.approved_by_admin = true)?;

        match choice {
            0 => Ok(IterationCapChoice::AcceptPartial),
            _ => Ok(IterationCapChoice::Extend(extend_by)),
        }
    }
}

fn plan_test_commands(plan: &Plan) -> Option<&[TestCommandSpec]> {
    match plan {
        Plan::Ok { test_commands, .. } => test_commands.as_deref(),
        Plan::NeedsUserInput { .. } => None,
    }
}
