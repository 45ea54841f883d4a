//! Stable exit codes for evoloop CLI commands.

/// Command succeeded, or `run` stopped on a configured stop condition.
pub const OK: i32 = 0;
/// Unrecoverable startup failure (missing collaborator, invalid config,
/// unrepairable state) or `validate` found the state inconsistent.
pub const FAILURE: i32 = 1;
