//! Logging initialisation via tracing-subscriber.
//!
//! The host embedding the SDK normally installs its own subscriber; this
//! helper exists for binaries and tests that run the manager standalone.

use tracing_subscriber::EnvFilter;

use crate::error::ManagerError;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence when set; otherwise `default_level` is used
/// (`"error"` … `"trace"`). Safe to call more than once — a subscriber
/// installed earlier wins and the second call reports an error.
pub fn init(default_level: &str) -> Result<(), ManagerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| ManagerError::Logger(format!("invalid level '{default_level}': {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| ManagerError::Logger(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_rejected() {
        // Only runs the filter-parsing path when RUST_LOG is unset.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(init("not-a-level").is_err());
        }
    }

    #[test]
    fn init_is_idempotent_enough() {
        // A second init must not panic; either outcome is acceptable.
        let _ = init("info");
        let _ = init("info");
    }
}
