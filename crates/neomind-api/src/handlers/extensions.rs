//! Extension API handlers.
//!
//! Every handler delegates to the extension service; errors carry the
//! extension error code and map onto HTTP status in [`ErrorResponse`].

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use neomind_extension_host::extension::{
    CircuitStatus, DiscoveryReport, ExtensionDetails, ExtensionSummary, HealthReport,
    MetricsSnapshot, ToolDescriptor,
};

use super::common::{ok, HandlerResult};
use super::ServerState;
use crate::models::ErrorResponse;

/// Request to execute an extension command.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub extension_id: String,
    pub command: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnloadResult {
    pub id: String,
    pub unloaded: bool,
}

/// GET /api/extensions
pub async fn list_extensions_handler(
    State(state): State<ServerState>,
) -> HandlerResult<Vec<ExtensionSummary>> {
    ok(state.service.list().await)
}

/// POST /api/extensions/discover
pub async fn discover_extensions_handler(
    State(state): State<ServerState>,
) -> HandlerResult<DiscoveryReport> {
    let report = state.service.discover().await?;
    info!(
        loaded = report.loaded.len(),
        failed = report.failures.len(),
        "Discovery requested over HTTP"
    );
    ok(report)
}

/// GET /api/extensions/tools
pub async fn list_extension_tools_handler(
    State(state): State<ServerState>,
) -> HandlerResult<Vec<ToolDescriptor>> {
    ok(state.service.tools().await)
}

/// GET /api/extensions/:id
pub async fn get_extension_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<ExtensionDetails> {
    ok(state.service.describe(&id).await?)
}

/// DELETE /api/extensions/:id
pub async fn unload_extension_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<UnloadResult> {
    state.service.unload(&id).await?;
    ok(UnloadResult { id, unloaded: true })
}

/// POST /api/extensions/:id/reload
pub async fn reload_extension_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<ExtensionDetails> {
    ok(state.service.reload(&id).await?)
}

/// GET /api/extensions/:id/health
pub async fn extension_health_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<HealthReport> {
    ok(state.service.health(&id).await?)
}

/// GET /api/extensions/:id/metrics
pub async fn extension_metrics_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<MetricsSnapshot> {
    ok(state.service.current_metrics(&id).await?)
}

/// POST /api/extensions/:id/command
pub async fn execute_extension_command_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteCommandRequest>,
) -> HandlerResult<CommandResult> {
    if req.command.trim().is_empty() {
        return Err(ErrorResponse::bad_request("command must not be empty"));
    }
    let result = state
        .service
        .execute_command(&id, &req.command, req.args)
        .await?;

    ok(CommandResult {
        extension_id: id,
        command: req.command,
        result,
    })
}

/// GET /api/extensions/:id/config
pub async fn get_extension_config_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<Value> {
    ok(state.service.get_config(&id).await?)
}

/// PUT /api/extensions/:id/config
pub async fn update_extension_config_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(config): Json<Value>,
) -> HandlerResult<ExtensionDetails> {
    ok(state.service.update_config(&id, config).await?)
}

/// POST /api/extensions/:id/circuit/reset
pub async fn reset_extension_circuit_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> HandlerResult<CircuitStatus> {
    ok(state.service.reset_circuit(&id).await?)
}
