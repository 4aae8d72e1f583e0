//! Basic handlers - health check.

use axum::extract::State;
use serde::Serialize;

use super::common::{ok, HandlerResult};
use super::ServerState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub extensions: usize,
}

/// GET /api/health
pub async fn health_handler(State(state): State<ServerState>) -> HandlerResult<HealthStatus> {
    let uptime = chrono::Utc::now().timestamp() - state.started_at;

    ok(HealthStatus {
        status: "ok",
        service: "neomind-host",
        version: env!("CARGO_PKG_VERSION"),
        uptime: uptime.max(0) as u64,
        extensions: state.service.registry().count().await,
    })
}
