//! Side-effecting collaborators: filesystem, git, child processes, persistence.

pub mod agent;
pub mod atomic;
pub mod code_writer;
pub mod config;
pub mod documents;
pub mod events;
pub mod git;
pub mod init;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod store;
