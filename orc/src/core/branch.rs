//! Branch-name construction and validation (Testable Property #6).

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn branch_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/\-]+$").expect("static regex"))
}

/// Sanitize one path component of a branch name to `[A-Za-z0-9._-]`, collapsing
/// any run of disallowed characters to a single `-` and trimming leading/
/// trailing `.` so the result can never contain `..`.
pub fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_replaced = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_was_replaced = false;
        } else if !last_was_replaced {
            out.push('-');
            last_was_replaced = true;
        }
    }
    let trimmed = out.trim_matches('.').to_string();
    let trimmed = trimmed.replace("..", "-");
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed
    }
}

/// `{sanitized_prefix}/{short_run_id}` for the run-level workspace.
pub fn run_branch_name(prefix: &str, run_id: &str) -> String {
    let prefix = sanitize_component(prefix);
    let run_id = sanitize_component(run_id);
    format!("{prefix}/{run_id}")
}

/// `{prefix}/{short_run_id}-i{iteration}-{short_cand_hash}` for candidate
/// workspaces; the suffix is a truncated SHA-256 of `candidate_id`.
pub fn candidate_branch_name(
    prefix: &str,
    run_id: &str,
    iteration: u32,
    candidate_id: &str,
    suffix_len: usize,
) -> String {
    let prefix = sanitize_component(prefix);
    let run_id = sanitize_component(run_id);
    let mut hasher = Sha256::new();
    hasher.update(candidate_id.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    let short = &hex[..suffix_len.min(hex.len())];
    format!("{prefix}/{run_id}-i{iteration}-{short}")
}

/// Testable Property #6: matches `^[A-Za-z0-9._/\-]+$` and contains no `..`.
pub fn validate_branch_name(name: &str) -> Result<(), String> {
    if !branch_name_regex().is_match(name) {
        return Err(format!("branch name '{name}' contains disallowed characters"));
    }
    if name.contains("..") {
        return Err(format!("branch name '{name}' contains '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_component("run@id!with spaces"), "run-id-with-spaces");
    }

    #[test]
    fn sanitize_never_produces_dot_dot() {
        let s = sanitize_component("../../etc/passwd");
        assert!(!s.contains(".."));
    }

    #[test]
    fn run_branch_name_is_prefix_slash_id() {
        assert_eq!(run_branch_name("orc", "run-abc123"), "orc/run-abc123");
    }

    #[test]
    fn candidate_branch_name_is_deterministic() {
        let a = candidate_branch_name("orc", "run1", 2, "iter2-r1-e1-1", 8);
        let b = candidate_branch_name("orc", "run1", 2, "iter2-r1-e1-1", 8);
        assert_eq!(a, b);
        assert!(a.starts_with("orc/run1-i2-"));
        assert_eq!(validate_branch_name(&a), Ok(()));
    }

    #[test]
    fn validate_rejects_dot_dot_and_bad_chars() {
        assert!(validate_branch_name("a/../b").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("fine/name-1.2_3").is_ok());
    }
}
