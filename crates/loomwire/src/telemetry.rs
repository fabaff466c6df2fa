//! Tracing setup for binaries and demos.

use tracing_subscriber::EnvFilter;

/// Installs a console subscriber filtered by `RUST_LOG`, falling back to
/// `info`. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
