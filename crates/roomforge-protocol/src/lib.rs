//! Shared data model for Roomforge.
//!
//! This crate defines the types every other layer speaks:
//!
//! - **Types** ([`Room`], [`RoomId`], [`RoomStatus`], [`Endpoint`],
//!   [`BackendRef`]) — the room record and its lifecycle state machine.
//! - **Templates** ([`Template`] and friends) — immutable blueprints.
//! - **Requests** ([`CreateRoomRequest`], [`RoomOverrides`]) — what
//!   callers send to create a room.
//! - **Errors** ([`ProtocolError`]) — data-model rule violations.
//!
//! # Architecture
//!
//! The protocol layer knows nothing about containers, locks, or sockets.
//!
//! ```text
//! Backend (instances) → Room (registry, manager) → Gateway / API
//!                 all speak roomforge-protocol types
//! ```

mod error;
mod request;
mod template;
mod types;

pub use error::ProtocolError;
pub use request::{CreateRoomRequest, RoomOverrides};
pub use template::{EnvVarSpec, ExposedPort, PortProtocol, ResourceLimits, Template};
pub use types::{BackendRef, Endpoint, Room, RoomId, RoomStatus, validate_room_name};
