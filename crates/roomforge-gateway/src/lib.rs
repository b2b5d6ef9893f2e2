//! Reverse proxy routing external traffic to Roomforge rooms.
//!
//! Requests under `/{prefix}/{key}/...` are resolved against the room
//! manager's live [`RouteTable`] (by room id or room name) and forwarded
//! to the room's endpoint with the `/{prefix}/{key}` part stripped.
//! WebSocket upgrades are relayed frame by frame.
//!
//! | situation | response |
//! |---|---|
//! | unknown key | 404, no upstream contact |
//! | room not running | 503, no upstream contact |
//! | upstream refuses | 502 |
//! | upstream too slow to connect | 504 |

mod error;
mod proxy;
mod routing;
mod ws;

pub use error::GatewayError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use roomforge_room::RouteTable;
use tokio::sync::watch;

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// First path segment routed to rooms.
    pub prefix: String,
    /// Upper bound on dialing a room (TCP connect, or the full WebSocket
    /// handshake).
    pub connect_timeout: Duration,
    /// Largest request body forwarded, in bytes.
    pub body_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefix: "rooms".to_string(),
            connect_timeout: Duration::from_secs(5),
            body_limit: 10 * 1024 * 1024,
        }
    }
}

pub(crate) struct GatewayState {
    routes: watch::Receiver<Arc<RouteTable>>,
    client: reqwest::Client,
    config: GatewayConfig,
}

/// The proxy. Build it once, then mount [`Gateway::router`].
#[derive(Clone)]
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(
        routes: watch::Receiver<Arc<RouteTable>>,
        mut config: GatewayConfig,
    ) -> Result<Self, GatewayError> {
        config.prefix = config.prefix.trim_matches('/').to_string();
        if config.prefix.is_empty() || config.prefix.contains('/') {
            return Err(GatewayError::Setup(format!(
                "prefix {:?} must be a single path segment",
                config.prefix
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::Setup(e.to_string()))?;
        Ok(Self {
            state: Arc::new(GatewayState {
                routes,
                client,
                config,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// Routes for `/{prefix}/{key}` and everything below it.
    pub fn router(&self) -> Router {
        let prefix = &self.state.config.prefix;
        Router::new()
            .route(&format!("/{prefix}/{{key}}"), any(handle))
            .route(&format!("/{prefix}/{{key}}/"), any(handle))
            .route(&format!("/{prefix}/{{key}}/{{*rest}}"), any(handle))
            .with_state(self.state.clone())
    }
}

async fn handle(State(gateway): State<Arc<GatewayState>>, request: Request) -> Response {
    match dispatch(&gateway, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(gateway: &GatewayState, request: Request) -> Result<Response, GatewayError> {
    let path = request.uri().path().to_owned();
    let query = request.uri().query().map(str::to_owned);
    let routed = routing::split_path(&gateway.config.prefix, &path, query.as_deref())
        .ok_or_else(|| GatewayError::UnknownRoom(path.clone()))?;

    let table = gateway.routes.borrow().clone();
    let (room_id, endpoint) = routing::resolve(&table, routed.key)?;

    if ws::is_upgrade_request(request.method(), request.headers()) {
        let (mut parts, _body) = request.into_parts();
        let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
            .await
            .map_err(|e| GatewayError::BadRequest(e.body_text()))?;
        return ws::upgrade(gateway, room_id, &endpoint, &routed, &parts.headers, upgrade).await;
    }

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    proxy::forward(gateway, room_id, &endpoint, &routed, client_ip, request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> watch::Receiver<Arc<RouteTable>> {
        watch::channel(Arc::new(RouteTable::default())).1
    }

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.prefix, "rooms");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_prefix_is_normalized() {
        let gateway = Gateway::new(
            routes(),
            GatewayConfig {
                prefix: "/r/".into(),
                ..GatewayConfig::default()
            },
        )
        .unwrap();
        assert_eq!(gateway.config().prefix, "r");
    }

    #[test]
    fn test_rejects_nested_prefix() {
        let result = Gateway::new(
            routes(),
            GatewayConfig {
                prefix: "a/b".into(),
                ..GatewayConfig::default()
            },
        );
        assert!(matches!(result, Err(GatewayError::Setup(_))));
    }
}
