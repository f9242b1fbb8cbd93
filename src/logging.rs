//! Logging bootstrap helpers.
//!
//! The library itself only emits `tracing` events; embedding applications
//! own the subscriber. These helpers cover the common case of a binary that
//! just wants readable output controlled by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// the given directive when the variable is unset.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

/// Install the default subscriber at `info` level for this crate
pub fn init_default_logging() {
    init_logging("deploy_runner=info");
}
