//! Prompt Library: one `minijinja` template per phase, wrapped in the
//! teacher's budget-aware section model so a prompt that would exceed
//! `prompt_budget_bytes` drops the least essential parts first instead of
//! failing outright.
//!
//! Generalizes the teacher's `io/prompt.rs` (`PromptSection`/`PromptPack`/
//! `apply_budget`) across the eight phases this crate needs, rendering each
//! phase's body with `minijinja` the way `prompt_lab/src/render.rs` does.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::model::run::QnaEntry;
use crate::model::{Candidate, Plan};

const PLAN_TEMPLATE: &str = include_str!("../../prompts/plan.md.jinja");
const EXECUTE_TEMPLATE: &str = include_str!("../../prompts/execute.md.jinja");
const REVIEWER_FEEDBACK_TEMPLATE: &str = include_str!("../../prompts/reviewer_feedback.md.jinja");
const REVIEW_CANDIDATES_TEMPLATE: &str = include_str!("../../prompts/review_candidates.md.jinja");
const CLARIFICATION_TEMPLATE: &str = include_str!("../../prompts/clarification.md.jinja");
const CONFLICT_RESOLUTION_TEMPLATE: &str = include_str!("../../prompts/conflict_resolution.md.jinja");
const HANDOFF_TEMPLATE: &str = include_str!("../../prompts/handoff.md.jinja");
const ITERATION_CAP_TEMPLATE: &str = include_str!("../../prompts/iteration_cap.md.jinja");

#[derive(Debug, Clone, Serialize)]
struct CandidateView {
    id: String,
    executor_id: String,
    executor_summary: String,
    test_summary: String,
    diff_preview: String,
}

impl From<&Candidate> for CandidateView {
    fn from(c: &Candidate) -> Self {
        Self {
            id: c.id.clone(),
            executor_id: c.executor_id.clone(),
            executor_summary: c.executor_summary.clone().unwrap_or_default(),
            test_summary: c
                .test_results
                .as_ref()
                .map(|t| t.one_line_summary())
                .unwrap_or_else(|| "no tests ran".to_string()),
            diff_preview: c.diff_preview.clone().unwrap_or_default(),
        }
    }
}

pub struct PromptBuilder {
    budget_bytes: usize,
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE).expect("static template");
        env.add_template("execute", EXECUTE_TEMPLATE).expect("static template");
        env.add_template("reviewer_feedback", REVIEWER_FEEDBACK_TEMPLATE)
            .expect("static template");
        env.add_template("review_candidates", REVIEW_CANDIDATES_TEMPLATE)
            .expect("static template");
        env.add_template("clarification", CLARIFICATION_TEMPLATE)
            .expect("static template");
        env.add_template("conflict_resolution", CONFLICT_RESOLUTION_TEMPLATE)
            .expect("static template");
        env.add_template("handoff", HANDOFF_TEMPLATE).expect("static template");
        env.add_template("iteration_cap", ITERATION_CAP_TEMPLATE)
            .expect("static template");
        Self { budget_bytes, env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name).with_context(|| format!("load template {name}"))?;
        template.render(ctx).with_context(|| format!("render template {name}"))
    }

    pub fn build_plan(&self, task: &str, user_qna: &[QnaEntry]) -> Result<PromptPack> {
        let body = self.render("plan", context! { task, user_qna })?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    pub fn build_execute(&self, plan: &Plan, reviewer_notes: Option<&str>) -> Result<PromptPack> {
        let Plan::Ok { claude_prompt, tasks, notes, .. } = plan else {
            anyhow::bail!("build_execute requires an OK plan");
        };
        let body = self.render(
            "execute",
            context! {
                claude_prompt,
                tasks,
                notes => reviewer_notes.or(notes.as_deref()),
            },
        )?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    pub fn build_reviewer_feedback(&self, questions: &[String]) -> Result<PromptPack> {
        let body = self.render("reviewer_feedback", context! { questions })?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    pub fn build_review_candidates(&self, candidates: &[Candidate]) -> Result<PromptPack> {
        let views: Vec<CandidateView> = candidates.iter().map(CandidateView::from).collect();
        let body = self.render("review_candidates", context! { candidates => views })?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    pub fn build_clarification(&self, questions: &[String]) -> Result<PromptPack> {
        let body = self.render("clarification", context! { questions })?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_conflict_resolution(
        &self,
        plan_summary: &str,
        reviewer_decisions: &str,
        candidate_rollup: &str,
        git_status_excerpt: &str,
        merge_output: &str,
        conflicted_files: &[String],
        commit_message: &str,
    ) -> Result<PromptPack> {
        let body = self.render(
            "conflict_resolution",
            context! {
                plan_summary,
                reviewer_decisions,
                candidate_rollup,
                git_status_excerpt,
                merge_output,
                conflicted_files,
                commit_message,
            },
        )?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    pub fn build_handoff(&self, candidate_summary: &str, task: &str) -> Result<PromptPack> {
        let body = self.render("handoff", context! { candidate_summary, task })?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_iteration_cap(
        &self,
        iteration: u32,
        max_iterations: u32,
        missing_work_summary: &str,
        extend_by: u32,
        request_id: &str,
    ) -> Result<PromptPack> {
        let body = self.render(
            "iteration_cap",
            context! { iteration, max_iterations, missing_work_summary, extend_by, request_id },
        )?;
        Ok(PromptPack::single(body, self.budget_bytes))
    }
}

/// A rendered prompt, one section, truncated to fit `budget_bytes` if needed.
/// Generalizes the teacher's multi-section `PromptPack`: this crate's phase
/// bodies are already one coherent block by the time `minijinja` renders
/// them, so there is exactly one section to (possibly) truncate.
#[derive(Debug, Clone)]
pub struct PromptPack {
    body: String,
}

impl PromptPack {
    fn single(body: String, budget_bytes: usize) -> Self {
        let body = if body.len() > budget_bytes {
            truncate_to(&body, budget_bytes)
        } else {
            body
        };
        Self { body }
    }

    pub fn render(&self) -> String {
        self.body.clone()
    }
}

fn truncate_to(content: &str, max_len: usize) -> String {
    let suffix = "\n[truncated]";
    if max_len <= suffix.len() {
        return suffix[..max_len].to_string();
    }
    let mut truncated = content.chars().take(max_len - suffix.len()).collect::<String>();
    truncated.push_str(suffix);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::TaskSpec;

    #[test]
    fn plan_prompt_includes_task_and_prior_qna() {
        let builder = PromptBuilder::new(10_000);
        let qna = vec![QnaEntry {
            question: "Throw or return NaN?".to_string(),
            answer: "Throw.".to_string(),
        }];
        let pack = builder.build_plan("divide by zero handling", &qna).unwrap();
        let rendered = pack.render();
        assert!(rendered.contains("divide by zero handling"));
        assert!(rendered.contains("Throw or return NaN?"));
    }

    #[test]
    fn execute_prompt_lists_tasks() {
        let builder = PromptBuilder::new(10_000);
        let plan = Plan::Ok {
            claude_prompt: "implement it".to_string(),
            tasks: vec![TaskSpec {
                id: "t1".to_string(),
                title: "Add guard".to_string(),
                description: "Throw on zero divisor".to_string(),
            }],
            test_commands: None,
            notes: None,
        };
        let pack = builder.build_execute(&plan, None).unwrap();
        let rendered = pack.render();
        assert!(rendered.contains("Add guard"));
        assert!(rendered.contains("implement it"));
    }

    #[test]
    fn review_candidates_prompt_includes_each_candidate_summary() {
        let builder = PromptBuilder::new(10_000);
        let mut candidate = Candidate::new(1, "rev-1", "exec-1", 1, "/tmp/ws".into());
        candidate.executor_summary = Some("added a guard clause".to_string());
        candidate.diff_preview = Some("+ if divisor == 0 { ... }".to_string());
        let pack = builder.build_review_candidates(&[candidate]).unwrap();
        let rendered = pack.render();
        assert!(rendered.contains("added a guard clause"));
        assert!(rendered.contains("iter1-rev-1-exec-1-1"));
    }

    #[test]
    fn long_prompt_is_truncated_to_budget() {
        let builder = PromptBuilder::new(200);
        let questions: Vec<String> = (0..100).map(|n| format!("question number {n}")).collect();
        let pack = builder.build_clarification(&questions).unwrap();
        assert!(pack.render().len() <= 200);
        assert!(pack.render().ends_with("[truncated]"));
    }
}
