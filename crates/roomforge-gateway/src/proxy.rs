//! HTTP forwarding.

use std::net::IpAddr;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use roomforge_protocol::{Endpoint, RoomId};

use crate::routing::{RoutedPath, strip_hop_by_hop, upstream_request_headers};
use crate::{GatewayError, GatewayState};

/// Forwards one request to `endpoint` and streams the response back.
pub(crate) async fn forward(
    gateway: &GatewayState,
    room_id: RoomId,
    endpoint: &Endpoint,
    routed: &RoutedPath<'_>,
    client_ip: Option<IpAddr>,
    request: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let limit = gateway.config.body_limit;
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::BodyTooLarge(limit))?;

    let url = format!("http://{endpoint}{}", routed.upstream);
    let headers = upstream_request_headers(&parts.headers, client_ip, &routed.public_prefix);
    tracing::debug!(room_id = %room_id, method = %parts.method, %url, "forwarding request");

    let upstream = gateway
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| classify(&url, e))?;

    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn classify(url: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout(format!("{url}: {e}"))
    } else if e.is_connect() {
        GatewayError::UpstreamConnect(format!("{url}: {e}"))
    } else {
        GatewayError::Upstream(format!("{url}: {e}"))
    }
}
