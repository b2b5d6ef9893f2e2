//! Error types for the room layer.

use std::fmt;

use roomforge_backend::BackendError;
use roomforge_protocol::ProtocolError;

use crate::allocator::AllocError;

/// Errors a room manager operation can return.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("room {0} not found")]
    NotFound(String),

    /// The template does not exist.
    #[error("template {0} not found")]
    TemplateNotFound(String),

    /// Duplicate name, or a conflicting object on the engine.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Ports or engine capacity ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine or the instance did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation is not valid from the room's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The engine is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Malformed request (bad name, unknown env var, ...).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Terminal engine failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Coarse class of a [`RoomError`], used for transport mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ResourceExhausted,
    Timeout,
    InvalidState,
    BackendUnavailable,
    Invalid,
    Backend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
            Self::InvalidState => "invalid_state",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Invalid => "invalid",
            Self::Backend => "backend",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::TemplateNotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }
}

impl From<BackendError> for RoomError {
    fn from(e: BackendError) -> Self {
        match e {
            // A missing instance or image is an engine-side failure, not
            // a missing room.
            BackendError::NotFound(msg) => Self::Backend(format!("not found: {msg}")),
            BackendError::Conflict(msg) => Self::Conflict(msg),
            BackendError::ResourceExhausted(msg) => Self::ResourceExhausted(msg),
            BackendError::Timeout(msg) => Self::Timeout(msg),
            BackendError::Unavailable(msg) => Self::BackendUnavailable(msg),
            BackendError::Failed(msg) => Self::Backend(msg),
        }
    }
}

impl From<AllocError> for RoomError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Exhausted { .. } => Self::ResourceExhausted(e.to_string()),
            AllocError::Conflict(_) => Self::Conflict(e.to_string()),
            AllocError::AlreadyReleased(_) => Self::InvalidState(e.to_string()),
        }
    }
}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidTransition { .. } | ProtocolError::EndpointMismatch(_) => {
                Self::InvalidState(e.to_string())
            }
            _ => Self::Invalid(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use roomforge_protocol::RoomStatus;

    use super::*;

    #[test]
    fn test_backend_errors_map_onto_taxonomy() {
        let cases = [
            (BackendError::Conflict("x".into()), ErrorKind::Conflict),
            (BackendError::ResourceExhausted("x".into()), ErrorKind::ResourceExhausted),
            (BackendError::Timeout("x".into()), ErrorKind::Timeout),
            (BackendError::Unavailable("x".into()), ErrorKind::BackendUnavailable),
            (BackendError::Failed("x".into()), ErrorKind::Backend),
            (BackendError::NotFound("x".into()), ErrorKind::Backend),
        ];
        for (backend, kind) in cases {
            assert_eq!(RoomError::from(backend).kind(), kind);
        }
    }

    #[test]
    fn test_template_not_found_is_not_found() {
        assert_eq!(
            RoomError::TemplateNotFound("browser".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_protocol_errors() {
        let transition = ProtocolError::InvalidTransition {
            from: RoomStatus::Stopped,
            to: RoomStatus::Stopping,
        };
        assert_eq!(RoomError::from(transition).kind(), ErrorKind::InvalidState);
        let name = ProtocolError::InvalidName("-bad".into());
        assert_eq!(RoomError::from(name).kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::ResourceExhausted.to_string(), "resource_exhausted");
        assert_eq!(ErrorKind::BackendUnavailable.as_str(), "backend_unavailable");
    }
}
