//! Stable exit codes for plan-runner CLI commands.

/// Command succeeded or a unit was selected.
pub const OK: i32 = 0;
/// Command failed due to an invalid layout, config or plan, or another error.
pub const INVALID: i32 = 1;
/// `plan-runner next` found every unit done.
pub const COMPLETE: i32 = 2;
/// No unit can become eligible (`next` or `run`).
pub const BLOCKED: i32 = 3;
/// `plan-runner run` was interrupted.
pub const CANCELLED: i32 = 4;
