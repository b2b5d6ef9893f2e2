//! WebSocket relay.
//!
//! The upstream leg is dialed before the caller is upgraded, so an
//! unreachable room fails the handshake with 502 instead of producing a
//! socket that closes immediately. Once both legs are open, frames flow
//! both ways until either side closes or errors, then both are closed.

use axum::extract::ws::{
    CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade,
};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use roomforge_protocol::{Endpoint, RoomId};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::routing::RoutedPath;
use crate::{GatewayError, GatewayState};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Returns `true` for a GET asking to switch to the WebSocket protocol.
pub(crate) fn is_upgrade_request(method: &axum::http::Method, headers: &HeaderMap) -> bool {
    method == axum::http::Method::GET
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Dials the room, then upgrades the caller and starts relaying.
pub(crate) async fn upgrade(
    gateway: &GatewayState,
    room_id: RoomId,
    endpoint: &Endpoint,
    routed: &RoutedPath<'_>,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let url = format!("ws://{endpoint}{}", routed.upstream);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    if let Some(protocols) = headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let connect = tokio_tungstenite::connect_async(request);
    let (upstream, handshake) =
        match tokio::time::timeout(gateway.config.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(GatewayError::UpstreamConnect(format!("{url}: {e}"))),
            Err(_) => return Err(GatewayError::UpstreamTimeout(url)),
        };
    tracing::debug!(room_id = %room_id, %url, "websocket upstream connected");

    let selected = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let ws = match selected {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };
    Ok(ws.on_upgrade(move |socket| relay(socket, upstream, room_id)))
}

async fn relay(client: WebSocket, upstream: Upstream, room_id: RoomId) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, ClientMessage::Close(_));
            if let Some(msg) = to_upstream(msg) {
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let closing = matches!(msg, UpstreamMessage::Close(_));
            if let Some(msg) = to_client(msg) {
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {
            tracing::debug!(room_id = %room_id, "websocket client side ended");
        }
        _ = upstream_to_client => {
            tracing::debug!(room_id = %room_id, "websocket upstream side ended");
        }
    }
    // A leg that already forwarded a Close frame reports an error here.
    if let Err(e) = upstream_tx.close().await {
        tracing::debug!(room_id = %room_id, error = %e, "websocket upstream close failed");
    }
    if let Err(e) = client_tx.close().await {
        tracing::debug!(room_id = %room_id, error = %e, "websocket client close failed");
    }
}

// Each leg answers its own pings, so control frames are not relayed.

fn to_upstream(msg: ClientMessage) -> Option<UpstreamMessage> {
    match msg {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_owned().into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_owned().into(),
            }
        }))),
        ClientMessage::Ping(_) | ClientMessage::Pong(_) => None,
    }
}

fn to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| {
            ClientCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_owned().into(),
            }
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}
