use super::{error_response, lookup_session};
use crate::orchestrator::TURN_COUNT_KEY;
use crate::server::AppState;
use crate::state::Scope;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct StateQuery {
    /// Qualified key such as `session:turn_count`.
    key: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route("/api/v1/sessions/{id}", delete(delete_session))
        .route("/api/v1/sessions/{id}/state", get(get_session_state))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "user_id is required");
    }
    match state.sessions.create(user_id).await {
        Ok(handle) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "ok",
                "session": { "id": handle.id, "user_id": handle.user_id },
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "session create failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "error", e)
        }
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn delete_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_id", "session id must be a UUID");
    };
    match state.sessions.delete(id).await {
        Ok(true) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "not_found", format!("session {id} not found")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "error", e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_session_state(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StateQuery>,
) -> Response {
    let handle = match lookup_session(&state, &id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    if let Some(key) = query.key {
        let lookup = handle.peek(|s| s.state.get_qualified(&key).map(|v| v.cloned()));
        return match lookup {
            Ok(Ok(value)) => Json(serde_json::json!({
                "status": "ok",
                "key": key,
                "value": value,
            }))
            .into_response(),
            Ok(Err(e)) => error_response(StatusCode::BAD_REQUEST, "invalid_key", e),
            Err(busy) => error_response(StatusCode::CONFLICT, "turn_in_progress", busy),
        };
    }
    let snapshot = handle.peek(|s| {
        serde_json::json!({
            "status": "ok",
            "session_id": s.id,
            "user_id": s.user_id,
            "turn_count": crate::state::counter_value(s.state.get(Scope::Session, TURN_COUNT_KEY)),
            "messages": s.history.len(),
            "usage": s.usage_totals,
            "state": s.state.snapshot(),
        })
    });
    match snapshot {
        Ok(body) => Json(body).into_response(),
        Err(busy) => error_response(StatusCode::CONFLICT, "turn_in_progress", busy),
    }
}
