//! Tracing subscriber setup.
//!
//! The level is taken from `RUST_LOG` and falls back to `info`:
//!
//! ```bash
//! RUST_LOG=nocturne=debug nocturne 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Panics if one is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`] with a different fallback level.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Install the global subscriber unless one is already set. Returns whether
/// this call installed it.
pub fn try_init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}
