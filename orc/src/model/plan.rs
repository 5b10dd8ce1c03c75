use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCommandSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

/// A reviewer-produced plan. Tagged on `status` so the controller never has to
/// branch on a raw JSON shape: validate once at the boundary, dispatch on the
/// variant everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum Plan {
    #[serde(rename = "OK")]
    Ok {
        claude_prompt: String,
        tasks: Vec<TaskSpec>,
        #[serde(default)]
        test_commands: Option<Vec<TestCommandSpec>>,
        #[serde(default)]
        notes: Option<String>,
    },
    #[serde(rename = "NEEDS_USER_INPUT")]
    NeedsUserInput { questions: Vec<String> },
}

impl Plan {
    pub fn is_ok(&self) -> bool {
        matches!(self, Plan::Ok { .. })
    }
}
