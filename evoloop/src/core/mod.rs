//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod gates;
pub mod guardrail;
pub mod hash;
pub mod opportunity;
pub mod promotion;
pub mod types;
