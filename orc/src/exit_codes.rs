//! Process exit codes for the `orc` binary.

pub const OK: i32 = 0;
pub const INIT_ERROR: i32 = 1;
pub const RUN_FAILED: i32 = 2;
