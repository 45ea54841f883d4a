//! I/O for loop commands: persisted state, collaborators, and prompts.

pub mod config;
pub mod documents;
pub mod evaluator;
pub mod generator;
pub mod init;
pub mod process;
pub mod prompt;
pub mod rate_limiter;
pub mod store;
