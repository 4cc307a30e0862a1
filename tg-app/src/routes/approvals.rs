use super::{error_response, lookup_session};
use crate::approval::{ApprovalDecision, GateError};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResolveApprovalRequest {
    invocation_id: String,
    approved: bool,
    #[serde(default)]
    note: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v1/sessions/{id}/approvals",
            get(list_pending).post(resolve_approval),
        )
        .route(
            "/api/v1/sessions/{id}/approvals/{invocation_id}",
            get(get_invocation_status),
        )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_pending(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match lookup_session(&state, &id) {
        Ok(handle) => {
            Json(serde_json::json!({ "pending": handle.gate().pending() })).into_response()
        }
        Err(response) => response,
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_invocation_status(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, invocation_id)): Path<(String, String)>,
) -> Response {
    let handle = match lookup_session(&state, &id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    match handle.gate().status(&invocation_id) {
        Some(status) => Json(serde_json::json!({
            "invocation_id": invocation_id,
            "status": status,
        }))
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("invocation {invocation_id} not seen in this session"),
        ),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn resolve_approval(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Response {
    let handle = match lookup_session(&state, &id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    tracing::info!(
        tool_call_id = %req.invocation_id,
        approved = req.approved,
        "approval decision received"
    );
    let decision = ApprovalDecision {
        invocation_id: req.invocation_id,
        approved: req.approved,
        responder_note: req.note.filter(|n| !n.trim().is_empty()),
        decided_at: Utc::now(),
    };
    match handle.gate().resolve(decision) {
        Ok(()) => Json(serde_json::json!({ "status": "resolved" })).into_response(),
        Err(e @ GateError::StaleDecision { .. }) => {
            error_response(StatusCode::CONFLICT, "stale_decision", e)
        }
    }
}
