//! Validate-then-dispatch boundary checks (§9 Design Notes).
//!
//! Agent payloads arrive as `serde_json::Value`; these functions check shape
//! invariants the tagged-enum `serde` deserialization alone cannot express
//! (non-empty collections, the approval guardrail, winner-id membership)
//! before handing the value to `serde_json::from_value`. Collecting every
//! violation, rather than stopping at the first, mirrors the teacher's
//! `core::status_validator`/`core::invariants` shape.

use std::path::{Path, PathBuf};

use crate::model::Plan;

pub fn validate_plan_shape(value: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let status = value.get("status").and_then(|v| v.as_str());
    match status {
        Some("OK") => {
            let prompt_empty = value
                .get("claude_prompt")
                .and_then(|v| v.as_str())
                .is_none_or(str::is_empty);
            if prompt_empty {
                errors.push("plan status=OK requires a non-empty claude_prompt".to_string());
            }
            match value.get("tasks").and_then(|v| v.as_array()) {
                Some(tasks) if !tasks.is_empty() => {
                    for (idx, task) in tasks.iter().enumerate() {
                        for field in ["id", "title", "description"] {
                            if task.get(field).and_then(|v| v.as_str()).is_none_or(str::is_empty) {
                                errors.push(format!("plan tasks[{idx}].{field} must be non-empty"));
                            }
                        }
                    }
                }
                _ => errors.push("plan status=OK requires a non-empty tasks[]".to_string()),
            }
        }
        Some("NEEDS_USER_INPUT") => match value.get("questions").and_then(|v| v.as_array()) {
            Some(q) if !q.is_empty() => {}
            _ => errors.push(
                "plan status=NEEDS_USER_INPUT requires a non-empty questions[]".to_string(),
            ),
        },
        Some(other) => errors.push(format!("unrecognized plan status '{other}'")),
        None => errors.push("plan is missing a status field".to_string()),
    }
    errors
}

pub fn parse_plan(value: &serde_json::Value) -> Result<Plan, Vec<String>> {
    let errors = validate_plan_shape(value);
    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("plan deserialization failed despite shape check: {e}")])
}

/// Checks the approval guardrail and winner-id membership on the raw payload,
/// before it is ever deserialized into [`crate::model::ReviewerDecision`]
/// (Testable Property #5). The typed enum has no field for `next_prompt` on
/// `Approved`, so this check must happen on the raw value — once converted,
/// an erroneous non-null `next_prompt` would simply be silently discarded.
pub fn validate_decision_shape(value: &serde_json::Value, candidate_ids: &[String]) -> Vec<String> {
    let mut errors = Vec::new();
    let status = value.get("status").and_then(|v| v.as_str());
    match status {
        Some("APPROVED") | Some("REJECTED") => {
            let winner = value.get("winner_candidate_id").and_then(|v| v.as_str());
            match winner {
                Some(id) if !id.is_empty() => {
                    if !candidate_ids.iter().any(|c| c == id) {
                        errors.push(format!(
                            "winner_candidate_id '{id}' is not one of this iteration's candidates"
                        ));
                    }
                }
                _ => errors.push("decision requires a non-empty winner_candidate_id".to_string()),
            }
            if value.get("summary").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
                errors.push("decision requires a non-empty summary".to_string());
            }
            if value.get("feedback").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
                errors.push("decision requires a non-empty feedback".to_string());
            }

            let next_prompt = value.get("next_prompt");
            if status == Some("APPROVED") {
                if let Some(np) = next_prompt
                    && !np.is_null()
                {
                    errors.push(
                        "decision status=APPROVED must not set a non-null next_prompt".to_string(),
                    );
                }
            } else {
                let missing_or_empty = match next_prompt {
                    Some(v) => v.as_str().is_none_or(str::is_empty),
                    None => true,
                };
                if missing_or_empty {
                    errors.push(
                        "decision status=REJECTED requires a non-empty next_prompt".to_string(),
                    );
                }
            }
        }
        Some("NEEDS_USER_INPUT") => match value.get("questions").and_then(|v| v.as_array()) {
            Some(q) if !q.is_empty() => {}
            _ => errors.push(
                "decision status=NEEDS_USER_INPUT requires a non-empty questions[]".to_string(),
            ),
        },
        Some(other) => errors.push(format!("unrecognized decision status '{other}'")),
        None => errors.push("decision is missing a status field".to_string()),
    }
    errors
}

pub fn parse_decision(
    value: &serde_json::Value,
    candidate_ids: &[String],
) -> Result<crate::model::ReviewerDecision, Vec<String>> {
    let errors = validate_decision_shape(value, candidate_ids);
    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("decision deserialization failed despite shape check: {e}")])
}

/// Testable Property #9: reject `..`, a path separator, a leading `/`, or an
/// id that resolves outside `logs_root`.
pub fn validate_resume_id(id: &str, logs_root: &Path) -> Result<PathBuf, String> {
    if id.is_empty() {
        return Err("resume run id must not be empty".to_string());
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') || id.starts_with('/') {
        return Err(format!("resume run id '{id}' contains an unsafe path component"));
    }
    let candidate = logs_root.join(id);
    if candidate.parent() != Some(logs_root) {
        return Err(format!("resume run id '{id}' resolves outside logs_root"));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_tasks_on_ok_plan() {
        let value = json!({"status": "OK", "claude_prompt": "do it", "tasks": []});
        let errors = validate_plan_shape(&value);
        assert!(errors.iter().any(|e| e.contains("tasks")));
    }

    #[test]
    fn accepts_well_formed_ok_plan() {
        let value = json!({
            "status": "OK",
            "claude_prompt": "do it",
            "tasks": [{"id": "t1", "title": "Title", "description": "Desc"}],
        });
        assert!(validate_plan_shape(&value).is_empty());
        assert!(parse_plan(&value).unwrap().is_ok());
    }

    #[test]
    fn approved_with_non_null_next_prompt_is_rejected() {
        let ids = vec!["cand-1".to_string()];
        let value = json!({
            "status": "APPROVED",
            "winner_candidate_id": "cand-1",
            "summary": "ok",
            "feedback": "good",
            "next_prompt": "do more",
        });
        let errors = validate_decision_shape(&value, &ids);
        assert!(errors.iter().any(|e| e.contains("APPROVED")));
    }

    #[test]
    fn approved_with_null_next_prompt_is_accepted() {
        let ids = vec!["cand-1".to_string()];
        let value = json!({
            "status": "APPROVED",
            "winner_candidate_id": "cand-1",
            "summary": "ok",
            "feedback": "good",
            "next_prompt": null,
        });
        assert!(validate_decision_shape(&value, &ids).is_empty());
    }

    #[test]
    fn winner_must_exist_in_iteration() {
        let ids = vec!["cand-1".to_string()];
        let value = json!({
            "status": "APPROVED",
            "winner_candidate_id": "cand-unknown",
            "summary": "ok",
            "feedback": "good",
            "next_prompt": null,
        });
        let errors = validate_decision_shape(&value, &ids);
        assert!(errors.iter().any(|e| e.contains("not one of")));
    }

    #[test]
    fn rejected_requires_next_prompt() {
        let ids = vec!["cand-1".to_string()];
        let value = json!({
            "status": "REJECTED",
            "winner_candidate_id": "cand-1",
            "summary": "ok",
            "feedback": "needs work",
        });
        let errors = validate_decision_shape(&value, &ids);
        assert!(errors.iter().any(|e| e.contains("next_prompt")));
    }

    #[test]
    fn resume_id_rejects_traversal_and_separators() {
        let logs_root = Path::new("/tmp/logs_root_test_validate");
        assert!(validate_resume_id("../escape", logs_root).is_err());
        assert!(validate_resume_id("a/b", logs_root).is_err());
        assert!(validate_resume_id("/abs", logs_root).is_err());
        assert!(validate_resume_id("", logs_root).is_err());
    }

    #[test]
    fn resume_id_accepts_plain_id_under_logs_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs_root = temp.path();
        let run_dir = logs_root.join("run-abc123");
        std::fs::create_dir_all(&run_dir).expect("mkdir");
        let resolved = validate_resume_id("run-abc123", logs_root).expect("valid id");
        assert_eq!(resolved, run_dir);
    }
}
