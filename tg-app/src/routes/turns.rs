use super::{error_response, lookup_session};
use crate::emitter;
use crate::orchestrator::TurnError;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartTurnRequest {
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/sessions/{id}/turns", post(start_turn))
}

/// Start a turn and stream its events. The turn runs on its own task so the
/// response can be returned before the first event exists.
#[tracing::instrument(level = "info", skip_all)]
async fn start_turn(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StartTurnRequest>,
) -> Response {
    let handle = match lookup_session(&state, &id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    if req.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "message is required");
    }
    let mut session = match handle.try_begin_turn() {
        Ok(guard) => guard,
        Err(busy) => return error_response(StatusCode::CONFLICT, "turn_in_progress", busy),
    };

    let (emitter, rx) = emitter::channel(state.cfg.server.stream_buffer);
    let span = tracing::info_span!("turn", session_id = %handle.id);
    let task_state = state.clone();
    tokio::spawn(
        async move {
            let gate = handle.gate().clone();
            let run = task_state
                .orchestrator
                .run_turn(&mut session, &gate, &req.message, emitter);
            let result = tokio::select! {
                result = run => Some(result),
                _ = task_state.shutdown.cancelled() => None,
            };
            match result {
                Some(Ok(_)) | Some(Err(TurnError::Disconnected)) => {}
                Some(Err(e)) => tracing::error!(error = %e, "turn ended with error"),
                None => tracing::warn!("server shutting down; turn cancelled"),
            }
            if task_state.sessions.get(handle.id).is_none() {
                tracing::info!("session deleted during turn; not persisting");
                return;
            }
            if let Err(e) = task_state.sessions.commit(&session).await {
                tracing::error!(error = %e, "session persist failed");
            }
        }
        .instrument(span),
    );

    emitter::sse_response(rx)
}
