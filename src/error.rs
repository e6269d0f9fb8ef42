//! Error types for the channel manager.
//!
//! Dispatched operations return `Result<_, ManagerError>`. Errors are
//! either recoverable (per-call, surfaced as an async error to the host)
//! or fatal (the manager tears down and reports the channel failed);
//! [`ManagerError::is_fatal`] makes the distinction.

use thiserror::Error;

use crate::manager::framing::FramingError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("operation not permitted in state {0}")]
    InvalidState(&'static str),

    #[error("channel id mismatch: '{0}'")]
    ChannelMismatch(String),

    #[error("unknown link: {0}")]
    UnknownLink(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("no encoding component matches type '{0}'")]
    NoEncodingForType(String),

    #[error("component '{id}': {message}")]
    Component { id: String, message: String },

    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),

    #[error("logger init failed: {0}")]
    Logger(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// Whether this error poisons the whole manager rather than one call.
    ///
    /// A missing encoding means the composition itself is broken; an
    /// internal error means an invariant was violated. Everything else is
    /// per-call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ManagerError::NoEncodingForType(_) | ManagerError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ManagerError::NoEncodingForType("image/png".into()).is_fatal());
        assert!(ManagerError::Internal("bad".into()).is_fatal());
        assert!(!ManagerError::UnknownLink("l0".into()).is_fatal());
        assert!(!ManagerError::InvalidState("unactivated").is_fatal());
    }

    #[test]
    fn display_carries_context() {
        let e = ManagerError::UnknownConnection("c9".into());
        assert!(e.to_string().contains("c9"));
        let e = ManagerError::Component {
            id: "encoder0".into(),
            message: "encode failed".into(),
        };
        assert!(e.to_string().contains("encoder0"));
    }
}
