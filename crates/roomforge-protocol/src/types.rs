//! Core data model: room identity, endpoints, and the room record.
//!
//! These are the structures the manager stores in its registry, the
//! gateway routes on, and the API layer serializes to JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a room.
///
/// Newtype over a random UUID, so an id is never handed out twice, not
/// even across restarts of the manager. Serializes as the bare UUID
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidRoomId(s.to_string()))
    }
}

/// Opaque handle the backend adapter returns for an instance it created.
///
/// For the Docker adapter this is the container id. The manager never
/// looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(pub String);

impl BackendRef {
    /// Wraps a raw backend handle.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A network endpoint (host + port) the gateway proxies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidEndpoint(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// RoomStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a room.
///
/// ```text
/// Creating → Running → Stopping → Stopped → Removing → (deleted)
///    │          │          │         │  ↑       │
///    └──────────┴──────────┴─────────┴──┼───────┘
///                      ↓                │
///                    Error ─────────────┘ (only exit: Removing)
/// ```
///
/// Besides the main line, a stopped room can be started again
/// (`Stopped → Running`). No other transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Removing,
    Error,
}

impl RoomStatus {
    /// Returns `true` if moving from `self` to `target` is a legal edge.
    pub fn can_transition_to(self, target: Self) -> bool {
        use RoomStatus::*;
        matches!(
            (self, target),
            (Creating, Running)
                | (Creating, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Running)
                | (Stopped, Removing)
                | (Stopped, Error)
                | (Removing, Error)
                | (Error, Removing)
        )
    }

    /// Returns `true` while a lifecycle operation is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Creating | Self::Stopping | Self::Removing)
    }

    /// Returns `true` if the room may be removed directly.
    pub fn is_removable(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Removing => "Removing",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// One ephemeral containerized session and its tracked metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub template: String,
    pub status: RoomStatus,
    pub backend_ref: Option<BackendRef>,
    pub endpoint: Option<Endpoint>,
    pub allocated_ports: BTreeSet<u16>,
    /// Resolved environment the instance was created with.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Room {
    /// Creates a fresh record in `Creating` state.
    pub fn new(id: RoomId, name: impl Into<String>, template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            template: template.into(),
            status: RoomStatus::Creating,
            backend_ref: None,
            endpoint: None,
            allocated_ports: BTreeSet::new(),
            env: BTreeMap::new(),
            created_at: now,
            last_transition_at: now,
            last_error: None,
        }
    }

    /// Moves the room to `target`.
    ///
    /// This is the only place `status` and `endpoint` change together:
    /// `endpoint` must be `Some` exactly when `target` is `Running`, so
    /// the "endpoint iff running" invariant holds after every
    /// transition.
    pub fn transition(
        &mut self,
        target: RoomStatus,
        endpoint: Option<Endpoint>,
    ) -> Result<(), ProtocolError> {
        if !self.status.can_transition_to(target) {
            return Err(ProtocolError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }
        if (target == RoomStatus::Running) != endpoint.is_some() {
            return Err(ProtocolError::EndpointMismatch(target));
        }
        self.status = target;
        self.endpoint = endpoint;
        self.last_transition_at = Utc::now();
        if target == RoomStatus::Running {
            self.last_error = None;
        }
        Ok(())
    }

    /// Moves the room to `Error`, recording `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ProtocolError> {
        self.transition(RoomStatus::Error, None)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Checks the "endpoint iff running" invariant.
    pub fn endpoint_consistent(&self) -> bool {
        (self.status == RoomStatus::Running) == self.endpoint.is_some()
    }
}

/// Validates a caller-supplied room name.
///
/// Names are used in container names and URLs: 1 to 63 characters of
/// ASCII letters, digits, `_`, `.` and `-`, starting with a letter or
/// digit. A name that parses as a [`RoomId`] is rejected, since the
/// gateway resolves such keys as ids.
pub fn validate_room_name(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name.parse::<RoomId>().is_err();
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_endpoint() -> Option<Endpoint> {
        Some(Endpoint::new("127.0.0.1", 31000))
    }

    #[test]
    fn test_status_main_line_is_legal() {
        use RoomStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Removing));
    }

    #[test]
    fn test_status_rejects_skips() {
        use RoomStatus::*;
        assert!(!Creating.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Removing));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Stopped));
        assert!(!Removing.can_transition_to(Stopped));
    }

    #[test]
    fn test_error_only_exits_to_removing() {
        use RoomStatus::*;
        for target in [Creating, Running, Stopping, Stopped, Error] {
            assert!(!Error.can_transition_to(target), "Error -> {target}");
        }
        assert!(Error.can_transition_to(Removing));
    }

    #[test]
    fn test_transition_sets_endpoint_only_when_running() {
        let mut room = Room::new(RoomId::new(), "alice", "browser");
        assert!(room.transition(RoomStatus::Running, None).is_err());
        room.transition(RoomStatus::Running, running_endpoint()).unwrap();
        assert!(room.endpoint.is_some());
        assert!(room.endpoint_consistent());

        assert!(
            room.transition(RoomStatus::Stopping, running_endpoint())
                .is_err()
        );
        room.transition(RoomStatus::Stopping, None).unwrap();
        assert!(room.endpoint.is_none());
        assert!(room.endpoint_consistent());
    }

    #[test]
    fn test_transition_stamps_time() {
        let mut room = Room::new(RoomId::new(), "alice", "browser");
        let before = room.last_transition_at;
        room.transition(RoomStatus::Running, running_endpoint()).unwrap();
        assert!(room.last_transition_at >= before);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut room = Room::new(RoomId::new(), "alice", "browser");
        room.fail("boom").unwrap();
        assert_eq!(room.status, RoomStatus::Error);
        assert_eq!(room.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_endpoint_parse_and_display() {
        let ep: Endpoint = "10.0.0.2:8080".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.2", 8080));
        assert_eq!(ep.to_string(), "10.0.0.2:8080");

        let v6: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("nope".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_room_id_roundtrips_through_string() {
        let id = RoomId::new();
        let parsed: RoomId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RoomId>().is_err());
    }

    #[test]
    fn test_room_id_serializes_as_bare_string() {
        let id = RoomId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_validate_room_name() {
        assert!(validate_room_name("alice").is_ok());
        assert!(validate_room_name("room-1.test_a").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("-leading").is_err());
        assert!(validate_room_name("has space").is_err());
        assert!(validate_room_name("slash/name").is_err());
        assert!(validate_room_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_room_name_cannot_shadow_an_id() {
        let id = RoomId::new();
        assert!(validate_room_name(&id.to_string()).is_err());
        assert!(validate_room_name(&id.to_string().replace('-', "")).is_err());
        assert!(validate_room_name("a1b2c3d4").is_ok());
    }
}
