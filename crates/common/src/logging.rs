//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the log filter
///
/// `RUST_LOG` wins over `default_level` when it is set and valid.
pub fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Logging(format!("invalid filter: {}", e)))
}

/// Setup tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| crate::Error::Logging(format!("already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error", "client=debug,info"] {
            assert!(build_filter(level).is_ok(), "level {} rejected", level);
        }
    }

    #[test]
    fn test_second_setup_is_rejected() {
        // The first call may already lose to another test in this process
        let _ = setup_logging("info");
        let err = setup_logging("info").unwrap_err();
        assert!(matches!(err, crate::Error::Logging(ref msg) if msg.contains("already")));
    }
}
