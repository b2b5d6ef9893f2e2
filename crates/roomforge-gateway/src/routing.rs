//! Route-key extraction, lookups and header rewriting.

use std::net::IpAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use roomforge_protocol::{Endpoint, RoomId};
use roomforge_room::{Route, RouteTable};

use crate::GatewayError;

/// A request path split into the room key and the upstream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoutedPath<'a> {
    pub(crate) key: &'a str,
    /// Path (with leading `/`) and query forwarded upstream.
    pub(crate) upstream: String,
    /// Public path prefix of the room, e.g. `/rooms/alice`.
    pub(crate) public_prefix: String,
}

/// Splits `/{prefix}/{key}/{rest}` and re-attaches the query.
///
/// Works on the raw path so percent-encoding in `rest` reaches the
/// upstream untouched.
pub(crate) fn split_path<'a>(
    prefix: &str,
    path: &'a str,
    query: Option<&str>,
) -> Option<RoutedPath<'a>> {
    let after_prefix = path.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
    let (key, rest) = match after_prefix.split_once('/') {
        Some((key, rest)) => (key, rest),
        None => (after_prefix, ""),
    };
    if key.is_empty() {
        return None;
    }
    let mut upstream = format!("/{rest}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        upstream.push('?');
        upstream.push_str(query);
    }
    Some(RoutedPath {
        key,
        upstream,
        public_prefix: format!("/{prefix}/{key}"),
    })
}

/// Resolves a room key to a running endpoint.
///
/// Unknown keys and non-running rooms are rejected here, before any
/// upstream connection is attempted.
pub(crate) fn resolve(table: &RouteTable, key: &str) -> Result<(RoomId, Endpoint), GatewayError> {
    let target = table
        .lookup(key)
        .ok_or_else(|| GatewayError::UnknownRoom(key.to_string()))?;
    match target.route {
        Route::Ready(endpoint) => Ok((target.room_id, endpoint)),
        Route::Unavailable(status) => Err(GatewayError::RoomUnavailable {
            key: key.to_string(),
            status,
        }),
    }
}

// ---- Headers ----

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Copies `src` without hop-by-hop headers, including those the
/// `Connection` header nominates.
pub(crate) fn strip_hop_by_hop(src: &HeaderMap) -> HeaderMap {
    let nominated: Vec<String> = src
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if HOP_BY_HOP.contains(name) || nominated.iter().any(|n| n == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Request headers for the upstream leg.
///
/// `Host` and `Content-Length` are left to the HTTP client; the original
/// host, client address and public prefix travel in `X-Forwarded-*`.
pub(crate) fn upstream_request_headers(
    src: &HeaderMap,
    client_ip: Option<IpAddr>,
    public_prefix: &str,
) -> HeaderMap {
    let mut out = strip_hop_by_hop(src);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);

    if let Some(host) = src.get(header::HOST) {
        out.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    if let Some(ip) = client_ip {
        let xff = HeaderName::from_static("x-forwarded-for");
        let chain = match src.get(&xff).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            out.insert(xff, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(public_prefix) {
        out.insert(HeaderName::from_static("x-forwarded-prefix"), value);
    }
    out
}
