pub mod approvals;
pub mod health;
pub mod sessions;
pub mod turns;

use crate::server::AppState;
use crate::session::SessionHandle;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(sessions::router())
        .merge(turns::router())
        .merge(approvals::router())
}

pub(crate) fn error_response(status: StatusCode, code: &str, error: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": code, "error": error.to_string() })),
    )
        .into_response()
}

pub(crate) fn lookup_session(state: &AppState, id: &str) -> Result<SessionHandle, Response> {
    let Ok(id) = Uuid::parse_str(id) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            "session id must be a UUID",
        ));
    };
    state.sessions.get(id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("session {id} not found"),
        )
    })
}
