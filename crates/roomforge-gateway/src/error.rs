//! Error types for the gateway.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use roomforge_protocol::RoomStatus;

/// Why a proxied request could not be served.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No room with this id or name.
    #[error("no room {0}")]
    UnknownRoom(String),

    /// The room exists but is not running.
    #[error("room {key} is {status}")]
    RoomUnavailable { key: String, status: RoomStatus },

    /// The room's endpoint refused or dropped the connection.
    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// The upstream answered with something unusable.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The HTTP client could not be built.
    #[error("gateway setup failed: {0}")]
    Setup(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownRoom(_) => StatusCode::NOT_FOUND,
            Self::RoomUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamConnect(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Setup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::UnknownRoom(_) => "not_found",
            Self::RoomUnavailable { .. } => "room_unavailable",
            Self::UpstreamConnect(_) => "upstream_unreachable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Upstream(_) => "upstream_error",
            Self::BodyTooLarge(_) => "body_too_large",
            Self::BadRequest(_) => "bad_request",
            Self::Setup(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "proxy request failed");
        } else {
            tracing::debug!(%status, error = %self, "proxy request rejected");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.kind(), "message": self.to_string() })),
        )
            .into_response()
    }
}
