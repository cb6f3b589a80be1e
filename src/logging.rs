//! Logging initialization: wires `tracing` to stderr with an `EnvFilter`
//! controlled by `RUST_LOG`, falling back to a caller-supplied default
//! directive when the variable isn't set.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. Call once, near the top of
/// `main`. `default_directive` is used when `RUST_LOG` is unset (e.g.
/// `"info"` or `"meshcore=debug,warn"`).
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt().with_env_filter(filter).init();
}
