//! WASM extension tests: sandbox limits observed through the supervisor.

mod common;

use std::path::Path;

use common::*;
use neomind_extension_host::config::HostConfig;
use neomind_extension_host::extension::{ExtensionError, ExtensionKind, ExtensionService};
use serde_json::json;

async fn loaded(mut config: HostConfig) -> (tempfile::TempDir, ExtensionService) {
    let dir = tempfile::tempdir().unwrap();
    write_weather(dir.path());
    config.extensions.dir = dir.path().to_path_buf();
    let service = ExtensionService::new(config);
    let report = service.discover().await.unwrap();
    assert_eq!(report.loaded, vec![WEATHER_ID.to_string()]);
    (dir, service)
}

#[tokio::test]
async fn test_weather_scenario() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    let summary = &service.list().await[0];
    assert_eq!(summary.kind, ExtensionKind::Wasm);
    assert_eq!(summary.command_count, COMMAND_COUNT);

    let result = service
        .execute_command(WEATHER_ID, "query_weather", json!({"city": "Beijing"}))
        .await
        .unwrap();
    assert_eq!(result["city"], "Beijing");
    assert_eq!(result["temperature"], 21.5);

    let err = service
        .execute_command(WEATHER_ID, "bogus_command", json!({}))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(err.is_not_found());
    assert!(message.contains("query_weather"));
    assert!(message.contains("big_result"));

    let err = service
        .execute_command(WEATHER_ID, "query_weather", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::InvalidArguments(_)));
}

#[tokio::test]
async fn test_trap_is_contained() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    let err = service
        .execute_command(WEATHER_ID, "trap", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::ExecutionFailed(m) if m.contains("module trap")));

    let health = service.health(WEATHER_ID).await.unwrap();
    assert!(health.healthy);
    let result = service
        .execute_command(WEATHER_ID, "query_weather", json!({"city": "Beijing"}))
        .await
        .unwrap();
    assert_eq!(result["temperature"], 21.5);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    let err = service
        .execute_command(WEATHER_ID, "loop_forever", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::Timeout(_)));

    // The epoch interrupt frees the instance for the next call.
    let result = service
        .execute_command(WEATHER_ID, "query_weather", json!({"city": "Beijing"}))
        .await
        .unwrap();
    assert_eq!(result["city"], "Beijing");
    assert_eq!(service.supervisor().stats(WEATHER_ID).timeouts, 1);
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let mut config = host_config(Path::new("."));
    config.wasm.fuel_per_call = 1_000_000;
    config.safety.command_timeout_secs = 30;
    let (_dir, service) = loaded(config).await;

    let err = service
        .execute_command(WEATHER_ID, "loop_forever", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::ResourceExceeded(m) if m.contains("fuel")));
}

#[tokio::test]
async fn test_memory_limit() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    let err = service
        .execute_command(WEATHER_ID, "grow_memory", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::ResourceExceeded(m) if m.contains("memory")));
    assert_eq!(
        service.supervisor().circuit_status(WEATHER_ID).consecutive_failures,
        1
    );
}

#[tokio::test]
async fn test_result_larger_than_buffer() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    let err = service
        .execute_command(WEATHER_ID, "big_result", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtensionError::BufferTooSmall {
            needed: 4097,
            capacity: 4096
        }
    ));
}

#[tokio::test]
async fn test_smallest_buffer_still_fits() {
    let mut config = host_config(Path::new("."));
    config.extensions.result_buffer_bytes = 64;
    let (_dir, service) = loaded(config).await;

    // The forecast envelope is 61 bytes and still fits.
    let result = service
        .execute_command(WEATHER_ID, "query_weather", json!({"city": "Beijing"}))
        .await
        .unwrap();
    assert_eq!(result["city"], "Beijing");
}

#[tokio::test]
async fn test_update_config_recreates_instance() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;
    let before = service.registry().get(WEATHER_ID).await.unwrap();

    let details = service
        .update_config(WEATHER_ID, json!({"units": "metric"}))
        .await
        .unwrap();
    assert_eq!(details.config, json!({"units": "metric"}));
    assert_eq!(service.get_config(WEATHER_ID).await.unwrap(), json!({"units": "metric"}));

    let after = service.registry().get(WEATHER_ID).await.unwrap();
    assert!(!std::sync::Arc::ptr_eq(&before, &after));

    let err = service
        .update_config(WEATHER_ID, json!(["metric"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::InvalidConfig(_)));
    assert_eq!(service.get_config(WEATHER_ID).await.unwrap(), json!({"units": "metric"}));
}

#[tokio::test]
async fn test_reload_resets_breaker() {
    let (_dir, service) = loaded(host_config(Path::new("."))).await;

    service
        .execute_command(WEATHER_ID, "trap", json!({}))
        .await
        .unwrap_err();
    assert_eq!(
        service.supervisor().circuit_status(WEATHER_ID).consecutive_failures,
        1
    );

    let details = service.reload(WEATHER_ID).await.unwrap();
    assert_eq!(details.circuit.consecutive_failures, 0);
    assert_eq!(details.descriptor.metadata.id, WEATHER_ID);
}
