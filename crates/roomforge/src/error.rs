//! Unified error type for the Roomforge service.

use roomforge_backend::BackendError;
use roomforge_gateway::GatewayError;
use roomforge_protocol::ProtocolError;
use roomforge_room::{CatalogError, RoomError};

use crate::config::ConfigError;

/// Top-level error that wraps all crate-specific errors.
///
/// Bootstrap code deals with this single type; `#[from]` on each variant
/// lets `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RoomforgeError {
    /// Invalid configuration in the environment.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The template file could not be loaded.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Backend selection or engine failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A data-model rule was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A room lifecycle operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The gateway could not be set up.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Binding or serving the listener failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_backend_error() {
        let err: RoomforgeError = BackendError::Unavailable("daemon down".into()).into();
        assert!(matches!(err, RoomforgeError::Backend(_)));
        assert!(err.to_string().contains("daemon down"));
    }

    #[test]
    fn test_from_room_error() {
        let err: RoomforgeError = RoomError::Conflict("name taken".into()).into();
        assert!(matches!(err, RoomforgeError::Room(_)));
    }

    #[test]
    fn test_from_config_error() {
        let err: RoomforgeError = ConfigError::Invalid {
            var: "ROOMFORGE_BIND".into(),
            reason: "nope".into(),
        }
        .into();
        assert!(matches!(err, RoomforgeError::Config(_)));
        assert!(err.to_string().contains("ROOMFORGE_BIND"));
    }

    #[test]
    fn test_from_io_error() {
        let err: RoomforgeError = std::io::Error::other("bind failed").into();
        assert!(matches!(err, RoomforgeError::Io(_)));
    }
}
