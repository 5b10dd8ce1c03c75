//! Pure, deterministic logic: branch-name sanitization, consensus, and the
//! validate-then-dispatch boundary checks (§9).
//!
//! Matching the teacher's `core::{invariants,status_validator}` shape, the
//! validators here return `Vec<String>` error collections instead of
//! panicking or stopping at the first violation.

pub mod branch;
pub mod consensus;
pub mod validate;
