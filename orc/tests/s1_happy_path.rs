//! S1 — single iteration, happy path (SPEC_FULL §8): one reviewer, one
//! executor, copy strategy, approval on the first try. Drives a real
//! `Controller` with scripted agent/test-runner doubles over a throwaway
//! git repo, the way the teacher's `harness_lifecycle.rs` drives `run_step`
//! end-to-end instead of unit-testing each phase in isolation.

use std::time::Duration;

use orc::config::RunnerConfig;
use orc::controller::{Controller, RunOutcome};
use orc::io::broker::Broker;
use orc::io::prompt::PromptBuilder;
use orc::io::run_state::RunStateStore;
use orc::model::agent_spec::AgentRole;
use orc::model::run::Run;
use orc::test_support::{ScriptedAgentClient, ScriptedAgentResponse, ScriptedTestRunner, TestRepo};

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");
const DECISION_SCHEMA: &str = include_str!("../schemas/decision.schema.json");
const EXECUTOR_OUTPUT_SCHEMA: &str = include_str!("../schemas/executor_output.schema.json");
const TEXT_RESPONSE_SCHEMA: &str = include_str!("../schemas/text_response.schema.json");

fn write_schema(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn s1_single_iteration_approves_and_applies_diff() {
    let repo = TestRepo::init().unwrap();
    std::fs::write(repo.path().join("divide.js"), "function divide(a, b) { return a / b; }\n").unwrap();

    let mut cfg = RunnerConfig::default();
    cfg.orchestrator.workspace_strategy = orc::config::WorkspaceStrategyConfig::Copy;
    cfg.orchestrator.auto_merge_on_approval = false;
    cfg.orchestrator.commit_on_approval = false;

    let run_dir = tempfile::tempdir().unwrap();
    let schema_dir = run_dir.path().join("schemas");
    std::fs::create_dir_all(&schema_dir).unwrap();
    let plan_schema = write_schema(&schema_dir, "plan.schema.json", PLAN_SCHEMA);
    let decision_schema = write_schema(&schema_dir, "decision.schema.json", DECISION_SCHEMA);
    let executor_output_schema = write_schema(&schema_dir, "executor_output.schema.json", EXECUTOR_OUTPUT_SCHEMA);
    let text_response_schema = write_schema(&schema_dir, "text_response.schema.json", TEXT_RESPONSE_SCHEMA);

    let run = Run::new("run-s1", repo.path_buf(), "replace divide(a,b) to throw on b==0");
    let run_state = RunStateStore::create(run_dir.path(), run).unwrap();

    let workspaces = orc::io::workspace_manager::WorkspaceManager::new(run_dir.path().join("workspaces")).unwrap();
    let agent_client = ScriptedAgentClient::new(vec![
        ScriptedAgentResponse::Json(serde_json::json!({
            "status": "OK",
            "claude_prompt": "Throw a RangeError when b is zero.",
            "tasks": [{"id": "t1", "title": "guard divide", "description": "throw when b==0"}],
            "test_commands": null,
            "notes": null,
        })),
        ScriptedAgentResponse::JsonWithWrite {
            payload: serde_json::json!({
                "status": "DONE",
                "summary": "added a zero-divisor guard",
                "questions": null,
            }),
            relative_path: "divide.js".to_string(),
            contents: "function divide(a, b) { if (b === 0) throw new RangeError('division by zero'); return a / b; }\n"
                .to_string(),
        },
        ScriptedAgentResponse::Json(serde_json::json!({
            "status": "APPROVED",
            "winner_candidate_id": "iter1-reviewer-1-executor-1-1",
            "summary": "guard looks correct",
            "feedback": "zero-divisor guard matches the requested behavior",
            "next_prompt": null,
            "questions": null,
        })),
        ScriptedAgentResponse::Json(serde_json::json!({"text": "acknowledged"})),
    ]);
    let test_runner = ScriptedTestRunner::passing();
    let prompts = PromptBuilder::new(8 * 1024);
    let broker = Broker::new(run_dir.path(), Duration::from_millis(10));

    let reviewers = vec![orc::test_support::agent_spec("reviewer-1", AgentRole::Reviewer)];
    let executors = vec![orc::test_support::agent_spec("executor-1", AgentRole::Executor)];

    let controller = Controller::new(
        &cfg,
        repo.path_buf(),
        run_dir.path().to_path_buf(),
        run_state,
        workspaces,
        &agent_client,
        &test_runner,
        prompts,
        broker,
        None,
        reviewers,
        executors,
        plan_schema,
        decision_schema,
        executor_output_schema,
        text_response_schema,
    );

    let outcome = controller.run(None).unwrap();
    assert!(matches!(outcome, RunOutcome::Approved));

    let final_state = controller.run_state.get();
    assert_eq!(final_state.stage, orc::model::run::Stage::Complete);
    assert!(final_state.approved);
    assert!(final_state.persisted);

    // apply_changes_on_success defaults to true: the winning candidate's
    // edits must have been copied back into the repo.
    let contents = std::fs::read_to_string(repo.path().join("divide.js")).unwrap();
    assert!(contents.contains("RangeError"), "unexpected repo contents: {contents}");
}
