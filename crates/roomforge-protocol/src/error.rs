//! Error types for the data model.

use crate::RoomStatus;

/// Errors raised when a value violates the data model's rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The state machine has no edge between these two states.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RoomStatus, to: RoomStatus },

    /// An endpoint was given for a non-running state, or was missing
    /// when entering `Running`.
    #[error("endpoint must be set exactly when entering Running (target {0})")]
    EndpointMismatch(RoomStatus),

    /// A string could not be parsed as `host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A string could not be parsed as a room id.
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    /// A room name contains disallowed characters or has a bad length.
    #[error("invalid room name: {0:?}")]
    InvalidName(String),
}
