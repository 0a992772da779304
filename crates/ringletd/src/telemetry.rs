//! Logging initialization for the ringlet daemon.
//!
//! Human-readable logs to stdout through `tracing-subscriber`'s `fmt`
//! layer, filtered by `RUST_LOG` when set and by the configured level
//! otherwise.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, before any event is emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
