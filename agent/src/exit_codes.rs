//! Stable exit codes for autopentest CLI commands.

/// Command succeeded or the objective was completed.
pub const OK: i32 = 0;
/// Invalid config/arguments, busy workspace, session transaction failure or other errors.
pub const INVALID: i32 = 1;
/// `run` stopped without completing (iteration limit, repeated rejections, planner gave up).
pub const EXHAUSTED: i32 = 2;
/// The operator quit at an approval prompt.
pub const USER_QUIT: i32 = 3;
/// The planner stayed unreachable or unparseable after all retries.
pub const PLANNER_UNAVAILABLE: i32 = 4;
