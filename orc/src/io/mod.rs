//! I/O layer: subprocess execution, git plumbing, the durable state store,
//! workspace materialization, agent clients, the user/admin broker, the
//! Telegram side channel, prompt assembly, and the black-box test runner.

pub mod agent_client;
pub mod broker;
pub mod git;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod telegram;
pub mod testing;
pub mod workspace_manager;
