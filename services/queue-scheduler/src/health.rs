//! Status and readiness endpoints.
//!
//! Orchestrator probes read per-group queue counts here. Handlers only read
//! published status snapshots; they never touch the reconciler.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::state::{StatusReader, StatusSnapshot};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Per-group queue count, the readiness readout.
#[derive(Debug, Serialize)]
pub struct QueueCountResponse {
    pub group_id: String,
    pub queues: i64,
}

/// Build the status router.
pub fn router(status: StatusReader) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/groups", get(groups))
        .route("/v1/groups/{group_id}/queues", get(group_queues))
        .with_state(status)
}

/// Liveness probe: the process is up.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "queue-scheduler".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Full per-group status snapshot.
async fn groups(State(status): State<StatusReader>) -> Json<StatusSnapshot> {
    Json(status.snapshot())
}

/// Last observed actual queue count for one group.
async fn group_queues(
    State(status): State<StatusReader>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    match status.num_queues(&group_id) {
        Some(queues) => (StatusCode::OK, Json(QueueCountResponse { group_id, queues })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve the status router until shutdown.
pub async fn run_status_server(
    addr: SocketAddr,
    status: StatusReader,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind_addr = %listener.local_addr()?, "Status server listening");

    axum::serve(listener, router(status))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
