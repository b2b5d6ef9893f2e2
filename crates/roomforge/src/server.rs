//! `RoomforgeServer` builder and serve loop.
//!
//! One listener serves the management API under `/api` and the gateway
//! under `/{prefix}`; a [`Reconciler`] runs beside it until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use roomforge_backend::{Backend, DockerBackend, DockerConfig};
use roomforge_gateway::{Gateway, GatewayConfig, GatewayError};
use roomforge_room::{ManagerConfig, Reconciler, RoomManager, TemplateCatalog};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::RoomforgeError;
use crate::api;

/// Builder for configuring and starting a Roomforge server.
///
/// # Example
///
/// ```rust,ignore
/// use roomforge::prelude::*;
///
/// let server = RoomforgeServer::builder()
///     .bind("0.0.0.0:8080".parse()?)
///     .backend(select_backend("docker", DockerConfig::default())?)
///     .catalog(TemplateCatalog::load("templates.json")?)
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct RoomforgeServerBuilder {
    bind_addr: SocketAddr,
    manager_config: ManagerConfig,
    gateway_config: GatewayConfig,
    backend: Option<Arc<dyn Backend>>,
    catalog: TemplateCatalog,
    reconcile: bool,
}

impl RoomforgeServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            manager_config: ManagerConfig::default(),
            gateway_config: GatewayConfig::default(),
            backend: None,
            catalog: TemplateCatalog::new(),
            reconcile: true,
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = config;
        self
    }

    pub fn gateway_config(mut self, config: GatewayConfig) -> Self {
        self.gateway_config = config;
        self
    }

    /// Sets the backend adapter. Defaults to a [`DockerBackend`] with
    /// default settings.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Enables or disables the background reconciler (on by default).
    pub fn reconcile(mut self, enabled: bool) -> Self {
        self.reconcile = enabled;
        self
    }

    /// Wires manager, gateway and API together and binds the listener.
    pub async fn build(self) -> Result<RoomforgeServer, RoomforgeError> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(DockerBackend::new(DockerConfig::default())));
        let manager = RoomManager::new(self.manager_config, backend, self.catalog);

        let gateway = Gateway::new(manager.routes(), self.gateway_config)?;
        if gateway.config().prefix == "api" {
            return Err(GatewayError::Setup("gateway prefix \"api\" collides with the API".into()).into());
        }
        let router = api::router(manager.clone())
            .merge(gateway.router())
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(self.bind_addr).await?;
        Ok(RoomforgeServer {
            listener,
            manager,
            router,
            reconcile: self.reconcile,
        })
    }
}

impl Default for RoomforgeServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Roomforge server.
///
/// Call [`run()`](Self::run) or [`run_until()`](Self::run_until) to start
/// serving.
pub struct RoomforgeServer {
    listener: TcpListener,
    manager: RoomManager,
    router: Router,
    reconcile: bool,
}

impl RoomforgeServer {
    pub fn builder() -> RoomforgeServerBuilder {
        RoomforgeServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    /// Serves until the process is terminated.
    pub async fn run(self) -> Result<(), RoomforgeError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then drains connections and
    /// stops the reconciler.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RoomforgeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reconciler = self.reconcile.then(|| Reconciler::new(self.manager.clone()));
        let stop = reconciler.as_ref().map(Reconciler::shutdown_handle);
        let worker = reconciler.map(|r| tokio::spawn(async move { r.run().await }));

        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            backend = self.manager.backend_name(),
            "roomforge server running"
        );
        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(stop) = stop {
            stop.notify_one();
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "reconciler task failed");
            }
        }
        tracing::info!("roomforge server stopped");
        Ok(served?)
    }
}
