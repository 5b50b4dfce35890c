// src/utils/logging.rs
use tracing_subscriber::{fmt, EnvFilter};

/// Sets up the logging framework using tracing_subscriber.
/// Reads log level filters from the `RUST_LOG` environment variable.
/// Defaults to "info" if `RUST_LOG` is not set; `--debug` raises the crate to "debug".
pub fn setup_logging(debug: bool) {
    let default_level = if debug { "info,cmf_extractor=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // Thread names attribute job transitions to workers
    let _ = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();

    tracing::debug!("Logging setup complete.");
}
