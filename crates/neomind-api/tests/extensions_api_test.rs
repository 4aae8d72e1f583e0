//! Tests for extension handlers, called directly with a built-in extension.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use neomind_api::handlers::extensions::*;
use neomind_api::handlers::{basic, ServerState};
use neomind_extension_host::extension::{
    CircuitState, Extension, ExtensionCommand, ExtensionError, ExtensionMetadata,
    MetricDescriptor, ParameterDefinition, Result,
};
use neomind_extension_host::prelude::MetricDataType;
use neomind_extension_host::{ExtensionService, HostConfig};

struct Echo {
    metadata: ExtensionMetadata,
    commands: Vec<ExtensionCommand>,
}

impl Extension for Echo {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    fn metrics(&self) -> &[MetricDescriptor] {
        &[]
    }

    fn commands(&self) -> &[ExtensionCommand] {
        &self.commands
    }

    fn execute_command(&self, command: &str, args: &Value) -> Result<Value> {
        match command {
            "echo" => Ok(json!({ "echo": args["text"] })),
            _ => Err(ExtensionError::ExecutionFailed("always fails".into())),
        }
    }
}

async fn create_test_server_state() -> ServerState {
    let service = Arc::new(ExtensionService::new(HostConfig::default()));
    service
        .register(Box::new(Echo {
            metadata: ExtensionMetadata::new("neomind.echo", "Echo", semver::Version::new(1, 0, 0)),
            commands: vec![
                ExtensionCommand {
                    name: "echo".into(),
                    parameters: vec![ParameterDefinition {
                        name: "text".into(),
                        param_type: MetricDataType::String,
                        required: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ExtensionCommand {
                    name: "fail".into(),
                    ..Default::default()
                },
            ],
        }))
        .await
        .unwrap();
    ServerState::new(service)
}

fn request(command: &str, args: Value) -> Json<ExecuteCommandRequest> {
    Json(ExecuteCommandRequest {
        command: command.to_string(),
        args,
    })
}

#[tokio::test]
async fn test_health_handler() {
    let state = create_test_server_state().await;
    let response = basic::health_handler(State(state)).await.unwrap();
    let health = response.0.data.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.extensions, 1);
}

#[tokio::test]
async fn test_list_and_get() {
    let state = create_test_server_state().await;

    let list = list_extensions_handler(State(state.clone())).await.unwrap();
    let list = list.0.data.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].metadata.id, "neomind.echo");

    let details = get_extension_handler(State(state.clone()), Path("neomind.echo".into()))
        .await
        .unwrap();
    assert_eq!(details.0.data.unwrap().descriptor.commands.len(), 2);

    let err = get_extension_handler(State(state), Path("neomind.missing".into()))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::NOT_FOUND);
    assert_eq!(err.code, "not_found");
}

#[tokio::test]
async fn test_execute_command() {
    let state = create_test_server_state().await;

    let response = execute_extension_command_handler(
        State(state.clone()),
        Path("neomind.echo".into()),
        request("echo", json!({"text": "hello"})),
    )
    .await
    .unwrap();
    let result = response.0.data.unwrap();
    assert_eq!(result.command, "echo");
    assert_eq!(result.result, json!({"echo": "hello"}));

    let err = execute_extension_command_handler(
        State(state.clone()),
        Path("neomind.echo".into()),
        request("echo", json!({})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);

    let err = execute_extension_command_handler(
        State(state),
        Path("neomind.echo".into()),
        request("bogus_command", json!({})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::NOT_FOUND);
    assert_eq!(err.details.unwrap()["available"], json!(["echo", "fail"]));
}

#[tokio::test]
async fn test_open_circuit_is_unavailable() {
    let state = create_test_server_state().await;

    for _ in 0..5 {
        let err = execute_extension_command_handler(
            State(state.clone()),
            Path("neomind.echo".into()),
            request("fail", json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    let err = execute_extension_command_handler(
        State(state.clone()),
        Path("neomind.echo".into()),
        request("fail", json!({})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.code, "circuit_open");

    let status = reset_extension_circuit_handler(State(state), Path("neomind.echo".into()))
        .await
        .unwrap();
    assert_eq!(status.0.data.unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn test_tools_and_unload() {
    let state = create_test_server_state().await;

    let tools = list_extension_tools_handler(State(state.clone())).await.unwrap();
    let names: Vec<_> = tools.0.data.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["neomind.echo_echo", "neomind.echo_fail"]);

    unload_extension_handler(State(state.clone()), Path("neomind.echo".into()))
        .await
        .unwrap();
    let err = unload_extension_handler(State(state), Path("neomind.echo".into()))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_builtin_config_update_rejected() {
    let state = create_test_server_state().await;

    let config = get_extension_config_handler(State(state.clone()), Path("neomind.echo".into()))
        .await
        .unwrap();
    assert_eq!(config.0.data.unwrap(), json!({}));

    let err = update_extension_config_handler(
        State(state),
        Path("neomind.echo".into()),
        Json(json!({"verbose": true})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.code, "invalid_config");
}

#[tokio::test]
async fn test_error_response_body() {
    let err: neomind_api::ErrorResponse = ExtensionError::Timeout(30_000).into();
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}
