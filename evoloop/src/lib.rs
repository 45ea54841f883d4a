//! Autonomous search-evaluate-promote loop.
//!
//! Each iteration asks an external generation collaborator for a candidate,
//! scores it with an external evaluation collaborator, and decides under
//! explicit gates whether it replaces the tracked champion. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (gates, promotion state machine,
//!   opportunity scoring, consistency checks). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state store, subprocesses, prompts).
//!   Isolated behind traits so collaborators can be scripted in tests.
//!
//! Orchestration modules ([`generate`], [`batch`], [`promote`], [`step`],
//! [`looping`], [`select`], [`validate`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod batch;
pub mod core;
pub mod exit_codes;
pub mod generate;
pub mod io;
pub mod logging;
pub mod looping;
pub mod promote;
pub mod select;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
