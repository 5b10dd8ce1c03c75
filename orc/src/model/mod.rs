//! Data model: Run, AgentSpec, Plan, Candidate, ReviewerDecision, Workspace.
//!
//! Agent-produced payloads are modeled as tagged enums so the controller never
//! sees a raw `serde_json::Value` — validation happens once, at the boundary,
//! in [`crate::core::validate`].

pub mod agent_spec;
pub mod candidate;
pub mod decision;
pub mod executor_output;
pub mod plan;
pub mod run;
pub mod workspace;

pub use agent_spec::{AgentFamily, AgentRole, AgentSpec};
pub use candidate::{Candidate, CandidateStatus, TestCommandResult, TestResults};
pub use decision::ReviewerDecision;
pub use executor_output::ExecutorOutput;
pub use plan::{Plan, TaskSpec, TestCommandSpec};
pub use run::{OrchestratorMode, Run, RunStatus, Stage};
pub use workspace::{Workspace, WorkspaceStrategy};
