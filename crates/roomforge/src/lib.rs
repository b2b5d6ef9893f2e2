//! # Roomforge
//!
//! Ephemeral containerized rooms behind a routing gateway.
//!
//! Callers ask for a room by name and template; Roomforge allocates host
//! ports, starts an instance on a container backend, waits for it to come
//! up and routes `/rooms/{name}/...` (HTTP and WebSocket) to it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomforge::prelude::*;
//!
//! # async fn demo() -> Result<(), RoomforgeError> {
//! let server = RoomforgeServer::builder()
//!     .bind("127.0.0.1:8080".parse().map_err(std::io::Error::other)?)
//!     .backend(select_backend("mock", DockerConfig::default())?)
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod api;
mod config;
mod error;
mod server;

pub use api::ApiError;
pub use config::{ConfigError, ServerConfig};
pub use error::RoomforgeError;
pub use server::{RoomforgeServer, RoomforgeServerBuilder};

pub mod prelude {
    pub use crate::{ConfigError, RoomforgeError, RoomforgeServer, RoomforgeServerBuilder, ServerConfig};
    pub use roomforge_backend::{Backend, DockerBackend, DockerConfig, MockBackend, RetryPolicy, select_backend};
    pub use roomforge_gateway::{Gateway, GatewayConfig, GatewayError};
    pub use roomforge_protocol::{
        CreateRoomRequest, Endpoint, Room, RoomId, RoomOverrides, RoomStatus, Template,
    };
    pub use roomforge_room::{
        ErrorKind, ManagerConfig, OrphanPolicy, ReconcileReport, Reconciler, RoomError, RoomManager,
        TemplateCatalog,
    };
}
