//! Optional HTTP status surface.
//!
//! A small read-only router over the store: `/health`, `/status` and
//! `/metrics`, all JSON. Binding happens before the supervisor loop starts
//! so a port conflict is a startup failure, not a background surprise.

use crate::infrastructure::analytics::build_status;
use crate::infrastructure::persistence::QueueStore;
use crate::utils::config::HttpConfig;
use crate::utils::error::{OrchestratorError, OrchestratorResult};
use crate::utils::now_ts;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    store: Arc<QueueStore>,
}

/// Bind the status listener; a port in use is a startup error.
pub async fn bind(config: &HttpConfig) -> OrchestratorResult<tokio::net::TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::ConfigurationError {
            reason: format!("failed to bind status server on {addr}: {e}"),
        })
}

/// Serve the status API until the process exits.
pub async fn serve(
    listener: tokio::net::TcpListener,
    store: Arc<QueueStore>,
) -> OrchestratorResult<()> {
    let state = ApiState { store };
    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "status server listening");
    }
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::OperationFailed {
            reason: format!("status server failed: {e}"),
        })
}

async fn health(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let snapshot = state.store.snapshot().await;
    let orchestrator = &snapshot.agents.orchestrator;
    let healthy = orchestrator.health_score >= 60 || orchestrator.last_self_check == 0;

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "health_score": orchestrator.health_score,
        "issues": orchestrator.issues,
        "timestamp": now_ts(),
    });
    if healthy {
        Ok(Json(body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.store.snapshot().await;
    Json(build_status(&snapshot, now_ts()))
}

async fn metrics(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.store.snapshot().await;
    let recent: Vec<_> = snapshot
        .analytics
        .metrics
        .iter()
        .rev()
        .take(24)
        .cloned()
        .collect();
    Json(serde_json::json!({
        "metadata": snapshot.analytics.metadata,
        "recent_metrics": recent,
    }))
}
