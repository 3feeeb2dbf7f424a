//! Stable exit codes for taskloop CLI commands.

/// Command succeeded, a task is ready, or an execution completed.
pub const OK: i32 = 0;
/// Invalid config/plan, rejected operator command, or any other error.
pub const INVALID: i32 = 1;
/// `taskloop next` found nothing left to do.
pub const COMPLETE: i32 = 2;
/// `taskloop next` found only pending tasks with unsatisfied dependencies.
pub const BLOCKED: i32 = 3;
/// A foreground loop detached because its execution paused.
pub const PAUSED: i32 = 4;
