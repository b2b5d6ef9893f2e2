//! Container-engine abstraction for Roomforge.
//!
//! Provides the [`Backend`] trait the room manager drives, plus two
//! implementations:
//!
//! - [`DockerBackend`] — drives the `docker` CLI
//! - [`MockBackend`] — in-memory engine with failure injection, for tests
//!
//! New engines are added by implementing [`Backend`]; the manager only
//! ever holds an `Arc<dyn Backend>`.

mod docker;
mod error;
mod mock;
mod retry;

pub use docker::{DockerBackend, DockerConfig};
pub use error::BackendError;
pub use mock::{MockBackend, MockCalls};
pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use roomforge_protocol::{BackendRef, Endpoint, PortProtocol, ResourceLimits};
use serde::{Deserialize, Serialize};

/// Label keys stamped on every instance Roomforge creates.
///
/// Reconciliation uses them to tell managed instances apart and to
/// rebuild a room record for an instance the registry lost.
pub mod labels {
    pub const MANAGED: &str = "roomforge.managed";
    pub const ROOM_ID: &str = "roomforge.room-id";
    pub const ROOM_NAME: &str = "roomforge.room-name";
    pub const TEMPLATE: &str = "roomforge.template";
    /// Comma-separated host ports, first one is the proxied endpoint.
    pub const PORTS: &str = "roomforge.ports";

    /// Every label the manager writes and reads back.
    pub const ALL: [&str; 5] = [MANAGED, ROOM_ID, ROOM_NAME, TEMPLATE, PORTS];
}

/// A host port published to a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: PortProtocol,
}

/// Everything an engine needs to provision one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Engine-side instance name.
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    /// Port bindings; the first one is the proxied endpoint.
    pub ports: Vec<PortBinding>,
    pub labels: BTreeMap<String, String>,
}

/// What `inspect` reports about one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub running: bool,
    pub endpoint: Option<Endpoint>,
}

/// One entry of `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub backend_ref: BackendRef,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

/// The capability set the room manager requires from a container engine.
///
/// Every call is network- or process-bound; the manager never holds a
/// registry lock across one.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Engine identifier for logs (e.g. `"docker"`, `"mock"`).
    fn name(&self) -> &'static str;

    /// Provisions an instance without necessarily starting it.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<BackendRef, BackendError>;

    /// Starts a provisioned instance.
    async fn start(&self, backend_ref: &BackendRef) -> Result<(), BackendError>;

    /// Stops an instance. Stopping an already-stopped instance succeeds.
    async fn stop(&self, backend_ref: &BackendRef) -> Result<(), BackendError>;

    /// Removes an instance. Removing a missing instance succeeds, since
    /// the desired end state already holds.
    async fn remove(&self, backend_ref: &BackendRef) -> Result<(), BackendError>;

    /// Reports whether the instance runs and where it can be reached.
    async fn inspect(&self, backend_ref: &BackendRef) -> Result<InstanceStatus, BackendError>;

    /// Lists every instance this engine holds for Roomforge.
    async fn list(&self) -> Result<Vec<InstanceSummary>, BackendError>;
}

/// Picks a backend implementation by name.
pub fn select_backend(name: &str, docker: DockerConfig) -> Result<Arc<dyn Backend>, BackendError> {
    match name {
        "docker" => Ok(Arc::new(DockerBackend::new(docker))),
        "mock" => Ok(Arc::new(MockBackend::new())),
        other => Err(BackendError::Unavailable(format!("unknown backend {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_valid_backends() {
        assert_eq!(select_backend("docker", DockerConfig::default()).unwrap().name(), "docker");
        assert_eq!(select_backend("mock", DockerConfig::default()).unwrap().name(), "mock");
    }

    #[test]
    fn test_select_unknown_backend_fails() {
        let err = select_backend("podman-remote", DockerConfig::default()).err().unwrap();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
