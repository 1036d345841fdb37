//! Health and metrics HTTP server.
//!
//! - `GET /healthz/liveness`: always 200
//! - `GET /healthz/readiness`: 200 while the listener loop runs, 503 otherwise
//! - `GET /metrics`: listener counters as JSON

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldops_events::{ListenerStats, StatsSnapshot};

#[derive(Clone)]
pub struct HealthState {
    stats: Arc<ListenerStats>,
}

pub fn router(stats: Arc<ListenerStats>) -> Router {
    Router::new()
        .route("/healthz/liveness", get(liveness))
        .route("/healthz/readiness", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(HealthState { stats })
}

async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.stats.is_running() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "listener not running" })),
        )
    }
}

async fn metrics(State(state): State<HealthState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Serve `app` until `token` is cancelled, then drain in-flight requests for
/// at most `grace`.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    token: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health server listening");
    }

    let shutdown = token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        result = &mut server => return Ok(result?),
        _ = token.cancelled() => {}
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "health server drain timed out");
            Ok(())
        }
    }
}
