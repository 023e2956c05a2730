//! HTTP surface: health, readiness, metrics, status, session control and
//! the client time reference.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::encode_metrics;
use crate::state::{HubState, SessionReply};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub producers: usize,
    pub session: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimeResponse {
    pub timestamp_s: f64,
    pub timestamp_ns: i64,
    pub synced: bool,
    pub source: &'static str,
}

async fn health(State(state): State<Arc<HubState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        producers: state.producers.len(),
        session: state.sessions.current(),
    })
}

/// 200 while the listener accepts producers, 503 otherwise (startup or
/// shutdown)
async fn ready(State(state): State<Arc<HubState>>) -> (StatusCode, Json<HealthResponse>) {
    let accepting = state.is_accepting();
    let code = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if accepting { "ready" } else { "not_accepting" },
            producers: state.producers.len(),
            session: state.sessions.current(),
        }),
    )
}

async fn metrics(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    state.refresh_gauges();
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn status(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(state.status())
}

async fn get_session(State(state): State<Arc<HubState>>) -> Json<SessionReply> {
    Json(state.session())
}

async fn start_session(State(state): State<Arc<HubState>>) -> Response {
    match state.start_session() {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to start session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "error", "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn stop_session(State(state): State<Arc<HubState>>) -> Json<SessionReply> {
    Json(state.stop_session())
}

async fn time(State(state): State<Arc<HubState>>) -> Json<TimeResponse> {
    let nanos = state.clock.now_nanos();
    let synced = state.clock.is_synced();
    Json(TimeResponse {
        timestamp_s: nanos as f64 / 1_000_000_000.0,
        timestamp_ns: nanos,
        synced,
        source: if synced { "ntp" } else { "local" },
    })
}

pub fn create_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/session", get(get_session))
        .route("/session/start", post(start_session))
        .route("/session/stop", post(stop_session))
        .route("/api/time", get(time))
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<HubState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
