//! # HTTP Server
//!
//! HTTP server for metrics, health checks, and probes.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (200 once started and every cache has synced)
//! - `/leader` - Leadership state of every replica in this process
//!
//! The server runs on port 5000 by default (configurable via `METRICS_PORT` environment variable).

use crate::controller::cache::ResourceCache;
use crate::controller::leader::LeaderStatus;
use crate::observability::metrics;
use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Default)]
pub struct ServerState {
    pub is_ready: AtomicBool,
    /// Caches that must be synced before the process reports ready
    pub caches: Vec<ResourceCache>,
    /// `(identity, status)` per replica
    pub leaders: Vec<(String, LeaderStatus)>,
}

impl ServerState {
    pub fn new(caches: Vec<ResourceCache>, leaders: Vec<(String, LeaderStatus)>) -> Self {
        Self {
            is_ready: AtomicBool::new(false),
            caches,
            leaders,
        }
    }

    pub fn mark_ready(&self) {
        self.is_ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Relaxed) && self.caches.iter().all(ResourceCache::is_synced)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaLeadership {
    identity: String,
    state: &'static str,
    is_leader: bool,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/leader", get(leader_handler))
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn start_server(
    port: u16,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn leader_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let replicas: Vec<ReplicaLeadership> = state
        .leaders
        .iter()
        .map(|(identity, status)| ReplicaLeadership {
            identity: identity.clone(),
            state: status.state().as_str(),
            is_leader: status.is_leader(),
        })
        .collect();
    Json(replicas)
}
