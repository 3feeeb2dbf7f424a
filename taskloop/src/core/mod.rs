//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod calculator;
pub mod index_doc;
pub mod invariants;
pub mod output;
pub mod path;
pub mod plan_parser;
pub mod state_machine;
pub mod types;
