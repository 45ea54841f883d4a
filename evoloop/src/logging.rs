//! Operator-facing tracing for the loop.
//!
//! `evoloop run` is meant to run unattended for hours, so the default filter
//! keeps per-iteration progress at `info` for this crate and everything else
//! at `warn`. Subprocess and gate detail lives at `debug` under the
//! `evoloop::io::process` and `evoloop::batch` targets.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted and not part of the state directory.
//!
//! - **Iteration log (`iterations.jsonl`)**: The audit record of every
//!   iteration. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn,evoloop=info` if unset, so an
/// unattended run still reports iteration progress.
///
/// # Example
/// ```bash
/// RUST_LOG=evoloop=debug evoloop run --max-iterations 5
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,evoloop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
