//! Logging configuration for the pipeline.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// The filter comes from `TICKSCOPE_LOG`, then `RUST_LOG`, then `level`.
/// Calling this more than once is harmless.
pub fn init_logging(level: &str) {
    let filter = std::env::var("TICKSCOPE_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        info!("Logging initialized at level: {}", level);
    }
}

/// Initialize test logging (for use in tests)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
