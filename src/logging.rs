//! Tracing setup for binaries and examples embedding the engine.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install a stderr subscriber. Filter via `RUST_LOG`; defaults to
/// `spillway=info`. Safe to call more than once; later calls are
/// no-ops.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spillway=info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
