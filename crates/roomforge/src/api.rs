//! REST API over the room manager, served under `/api`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use roomforge_protocol::{CreateRoomRequest, Room, RoomId, Template};
use roomforge_room::{ErrorKind, RoomError, RoomManager};
use serde_json::{Value, json};

/// Routes for the management API.
pub fn router(manager: RoomManager) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/templates", get(list_templates))
        .route("/api/rooms", post(create_room).get(list_rooms))
        .route("/api/rooms/{id}", get(get_room).delete(remove_room))
        .route("/api/rooms/{id}/stop", post(stop_room))
        .route("/api/rooms/{id}/start", post(start_room))
        .route("/api/rooms/{id}/restart", post(restart_room))
        .with_state(manager)
}

// ---- Handlers ----

async fn health(State(manager): State<RoomManager>) -> Json<Value> {
    let routes = manager.routes().borrow().clone();
    Json(json!({
        "status": "ok",
        "backend": manager.backend_name(),
        "rooms": manager.list_rooms().len(),
        "routes_ready": routes.ready_count(),
        "available_ports": manager.available_ports(),
    }))
}

async fn list_templates(State(manager): State<RoomManager>) -> Json<Vec<Template>> {
    Json(manager.templates().iter().map(|t| t.as_ref().clone()).collect())
}

async fn create_room(
    State(manager): State<RoomManager>,
    body: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::invalid(e.body_text()))?;
    let room = manager.create_room(request).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn list_rooms(State(manager): State<RoomManager>) -> Json<Vec<Room>> {
    Json(manager.list_rooms())
}

async fn get_room(
    State(manager): State<RoomManager>,
    Path(id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(manager.get_room(parse_id(&id)?)?))
}

async fn stop_room(
    State(manager): State<RoomManager>,
    Path(id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(manager.stop_room(parse_id(&id)?).await?))
}

async fn start_room(
    State(manager): State<RoomManager>,
    Path(id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(manager.start_room(parse_id(&id)?).await?))
}

async fn restart_room(
    State(manager): State<RoomManager>,
    Path(id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    Ok(Json(manager.restart_room(parse_id(&id)?).await?))
}

async fn remove_room(
    State(manager): State<RoomManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.remove_room(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<RoomId, ApiError> {
    raw.parse().map_err(|e: roomforge_protocol::ProtocolError| ApiError::invalid(e.to_string()))
}

// ---- Errors ----

/// JSON error body `{"error": kind, "message": text}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::Invalid.as_str(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::ResourceExhausted | ErrorKind::BackendUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Backend => StatusCode::BAD_GATEWAY,
    }
}

impl From<RoomError> for ApiError {
    fn from(e: RoomError) -> Self {
        let kind = e.kind();
        Self {
            status: status_for(kind),
            kind: kind.as_str(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, error = %self.message, "api request failed");
        } else {
            tracing::debug!(status = %self.status, error = %self.message, "api request rejected");
        }
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}
