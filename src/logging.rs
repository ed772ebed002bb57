//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered by RUST_LOG.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// RUST_LOG selects the level (default `info`, since a pass logs one line
/// per page and per assignment at that level). Examples:
/// - `RUST_LOG=debug` - every device event
/// - `RUST_LOG=dep_assigner=debug,reqwest=warn` - per-crate levels
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::AssignerError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();

        tracing::info!(
            serial_number = "C02TEST",
            op_type = "added",
            "Testing structured logging"
        );
    }
}
