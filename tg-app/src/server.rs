//! HTTP server bootstrap: wiring, middleware and graceful shutdown.

use crate::config::{ProviderKind, ToolgateConfig};
use crate::orchestrator::Orchestrator;
use crate::persistence::SqliteStore;
use crate::routes;
use crate::session::SessionManager;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tg_llm::{InferenceProvider, OpenAiProvider, ScriptedProvider};
use tg_tools::{ToolRegistry, Workspace};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared by every handler through an `Extension`.
pub struct AppState {
    pub cfg: ToolgateConfig,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ToolgateConfig::load(config_path).await?;
    let tools = build_tools(&cfg)?;
    let provider = build_provider(&cfg)?;
    let classifier = cfg.classifier();
    let gated: Vec<String> = tools
        .names()
        .into_iter()
        .filter(|name| classifier.classify(name) != tg_tools::RiskTier::Safe)
        .collect();
    let stored_sessions = match cfg.state_path() {
        Some(path) => Some(SqliteStore::open(&path).await?.session_count().await?),
        None => None,
    };
    tracing::info!(
        model = %cfg.general.model,
        provider = provider.name(),
        tools = ?tools.names(),
        gated_tools = ?gated,
        approval_timeout_seconds = cfg.approval.timeout_seconds,
        stored_sessions = ?stored_sessions,
        bind_addr = %cfg.server.bind_addr,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ToolgateConfig::load(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", cfg.server.bind_addr))?;
    let listener = preflight_bind_listener(addr).await?;

    let shutdown = CancellationToken::new();
    let provider = build_provider(&cfg)?;
    let state = build_state(cfg, provider, shutdown.clone()).await?;
    let app = build_router(state.clone())?;

    tracing::info!(%addr, provider = state.orchestrator.provider_name(), "toolgate serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    shutdown.cancel();
    Ok(())
}

pub async fn build_state(
    cfg: ToolgateConfig,
    provider: Arc<dyn InferenceProvider>,
    shutdown: CancellationToken,
) -> Result<Arc<AppState>> {
    let tools = build_tools(&cfg)?;
    let store = match cfg.state_path() {
        Some(path) => Some(SqliteStore::open(&path).await?),
        None => {
            tracing::info!("state.path not set; sessions are kept in memory only");
            None
        }
    };
    let sessions = SessionManager::load_or_new(Arc::new(cfg.classifier()), store).await?;
    let orchestrator = Orchestrator::new(cfg.turn_settings(), provider, Arc::new(tools));
    Ok(Arc::new(AppState {
        cfg,
        sessions: Arc::new(sessions),
        orchestrator: Arc::new(orchestrator),
        shutdown,
        started_at: Utc::now(),
    }))
}

pub fn build_router(state: Arc<AppState>) -> Result<axum::Router> {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let cors = cors_layer(&state.cfg.server.cors_allow_origins)?;
    Ok(routes::router()
        .layer(Extension(state.clone()))
        .layer(cors)
        .layer(GlobalConcurrencyLimitLayer::new(
            state.cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(state.cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid)))
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);
    if origins.iter().any(|o| o == "*") {
        return Ok(layer.allow_origin(AllowOrigin::any()));
    }
    let parsed = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o)
                .map_err(|e| anyhow::anyhow!("invalid server.cors_allow_origins entry {o:?}: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(parsed)))
}

pub fn build_provider(cfg: &ToolgateConfig) -> Result<Arc<dyn InferenceProvider>> {
    match cfg.llm.provider {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(
            cfg.llm.base_url.as_deref(),
            cfg.llm.api_key.as_deref(),
            &cfg.general.model,
        )?)),
        ProviderKind::Scripted => {
            tracing::warn!("scripted provider selected; replies are canned");
            Ok(Arc::new(ScriptedProvider::default().with_fallback_text(
                "(scripted provider: no recorded reply)",
            )))
        }
    }
}

pub fn build_tools(cfg: &ToolgateConfig) -> Result<ToolRegistry> {
    let workspace = Workspace::new(cfg.workspace_root())?;
    let mut registry = ToolRegistry::new();
    let mut available = workspace.tools();
    for name in &cfg.tools.enabled {
        let Some(index) = available.iter().position(|t| &t.spec().name == name) else {
            return Err(anyhow::anyhow!("tools.enabled names unknown tool {name:?}"));
        };
        registry.register(available.swap_remove(index))?;
    }
    tracing::info!(
        tools = ?registry.names(),
        workspace_root = %workspace.root().display(),
        "tool registry built"
    );
    Ok(registry)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
