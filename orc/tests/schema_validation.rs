//! The four structured-output JSON Schema files must actually accept the
//! JSON shapes this crate's own types produce, and reject the shapes
//! `core::validate` would also reject. Grounded on the teacher's
//! `runner/src/main.rs` `cmd_validate`, which compiles a schema with the
//! `jsonschema` crate and checks an instance against it.

use serde_json::json;

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");
const DECISION_SCHEMA: &str = include_str!("../schemas/decision.schema.json");
const EXECUTOR_OUTPUT_SCHEMA: &str = include_str!("../schemas/executor_output.schema.json");
const TEXT_RESPONSE_SCHEMA: &str = include_str!("../schemas/text_response.schema.json");

fn validator(schema_text: &str) -> jsonschema::Validator {
    let schema: serde_json::Value = serde_json::from_str(schema_text).expect("schema is valid JSON");
    jsonschema::validator_for(&schema).expect("schema compiles")
}

#[test]
fn plan_schema_accepts_an_ok_plan_and_a_needs_input_plan() {
    let v = validator(PLAN_SCHEMA);
    let ok_plan = json!({
        "status": "OK",
        "claude_prompt": "do the thing",
        "tasks": [{"id": "t1", "title": "t", "description": "d"}],
        "test_commands": null,
        "notes": null,
        "questions": null,
    });
    assert!(v.is_valid(&ok_plan), "{:?}", v.iter_errors(&ok_plan).collect::<Vec<_>>());

    let needs_input = json!({
        "status": "NEEDS_USER_INPUT",
        "claude_prompt": null,
        "tasks": null,
        "test_commands": null,
        "notes": null,
        "questions": ["which branch?"],
    });
    assert!(v.is_valid(&needs_input));
}

#[test]
fn plan_schema_rejects_unknown_status_and_extra_fields() {
    let v = validator(PLAN_SCHEMA);
    let bad_status = json!({
        "status": "MAYBE",
        "claude_prompt": null,
        "tasks": null,
        "test_commands": null,
        "notes": null,
        "questions": null,
    });
    assert!(!v.is_valid(&bad_status));

    let extra_field = json!({
        "status": "OK",
        "claude_prompt": "x",
        "tasks": [],
        "test_commands": null,
        "notes": null,
        "questions": null,
        "unexpected": "field",
    });
    assert!(!v.is_valid(&extra_field));
}

#[test]
fn decision_schema_accepts_approved_rejected_and_needs_input() {
    let v = validator(DECISION_SCHEMA);
    for status in ["APPROVED", "REJECTED", "NEEDS_USER_INPUT"] {
        let instance = json!({
            "status": status,
            "winner_candidate_id": "cand-1",
            "summary": "s",
            "feedback": "f",
            "next_prompt": if status == "REJECTED" { json!("try again") } else { serde_json::Value::Null },
            "questions": null,
        });
        assert!(v.is_valid(&instance), "status {status} rejected: {:?}", v.iter_errors(&instance).collect::<Vec<_>>());
    }
}

#[test]
fn executor_output_schema_accepts_every_normalized_status() {
    let v = validator(EXECUTOR_OUTPUT_SCHEMA);
    for status in ["DONE", "FAILED", "NEEDS_REVIEWER", "NEEDS_CODEX"] {
        let instance = json!({"status": status, "summary": "ok", "questions": null});
        assert!(v.is_valid(&instance));
    }
}

#[test]
fn text_response_schema_requires_text_field() {
    let v = validator(TEXT_RESPONSE_SCHEMA);
    assert!(v.is_valid(&json!({"text": "hello"})));
    assert!(!v.is_valid(&json!({})));
    assert!(!v.is_valid(&json!({"text": "hello", "extra": 1})));
}

#[test]
fn no_schema_uses_combinator_keywords() {
    for schema_text in [PLAN_SCHEMA, DECISION_SCHEMA, EXECUTOR_OUTPUT_SCHEMA, TEXT_RESPONSE_SCHEMA] {
        for forbidden in ["oneOf", "allOf", "anyOf", "\"if\"", "\"then\"", "\"else\""] {
            assert!(!schema_text.contains(forbidden), "{forbidden} found in schema:\n{schema_text}");
        }
    }
}
