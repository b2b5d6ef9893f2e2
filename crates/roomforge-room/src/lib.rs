//! Room lifecycle management for Roomforge.
//!
//! A room is one containerized session. The [`RoomManager`] creates,
//! stops, starts and removes rooms on a [`Backend`](roomforge_backend::Backend),
//! holding host ports from a [`PortAllocator`] and blueprints from a
//! [`TemplateCatalog`].
//!
//! # Key types
//!
//! - [`RoomManager`] — lifecycle operations, serialized per room id
//! - [`RouteTable`] — routing view republished on every registry write
//! - [`Reconciler`] — background drift repair against the backend
//! - [`ManagerConfig`] — ports, timeouts, retries, orphan policy

mod allocator;
mod catalog;
mod config;
mod error;
mod locks;
mod manager;
mod reconcile;
mod registry;

pub use allocator::{AllocError, PortAllocator, PortReservation};
pub use catalog::{CatalogError, TemplateCatalog};
pub use config::{ManagerConfig, OrphanPolicy};
pub use error::{ErrorKind, RoomError};
pub use manager::RoomManager;
pub use reconcile::{ReconcileReport, Reconciler};
pub use registry::{Route, RouteTable, RouteTarget};
