//! Plan-driven execution orchestration for a code-generation agent.
//!
//! A plan lives in markdown documents: an index of milestones and task
//! checkboxes plus per-milestone detail documents. An execution walks the
//! plan one task at a time, asks the agent for a structured file-change
//! result, applies it atomically, and ticks the task off in the index.
//! Failures pause the execution for an operator; abort rolls the working
//! tree back to the snapshot taken at start.
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, selection, invariants,
//!   state machines, output validation). No I/O.
//! - **[`io`]**: Side-effecting collaborators behind traits (documents, agent,
//!   git, persistence, events). Swappable for fakes in tests.
//!
//! Orchestration modules ([`engine`], [`start`], [`step`], [`looping`],
//! [`control`], [`recover`], [`select`], [`validate`], [`phase`]) coordinate
//! core logic with I/O to implement the CLI commands.

pub mod control;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod phase;
pub mod recover;
pub mod select;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
