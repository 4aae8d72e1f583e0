//! Dispatch API consumed by the HTTP server, the CLI and AI agents.
//!
//! Every operation that reaches extension code goes through the
//! [`SafetySupervisor`]; there is no unsupervised path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{ExtensionError, Result};
use super::handle::ExtensionHandle;
use super::registry::{DiscoveryReport, ExtensionRegistry};
use super::safety::{CircuitState, CircuitStatus};
use super::supervisor::SafetySupervisor;
use super::system::{
    Extension, ExtensionDescriptor, ExtensionKind, ExtensionMetadata, ExtensionMetricValue,
    ExtensionStats, ParamMetricValue, ToolDescriptor,
};
use crate::config::HostConfig;

/// One row of the extension listing.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSummary {
    #[serde(flatten)]
    pub metadata: ExtensionMetadata,
    pub kind: ExtensionKind,
    pub file_path: Option<PathBuf>,
    pub loaded_at: DateTime<Utc>,
    /// Last known health; `None` until the first check.
    pub healthy: Option<bool>,
    pub circuit_state: CircuitState,
    pub metric_count: usize,
    pub command_count: usize,
}

/// Everything known about one extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionDetails {
    #[serde(flatten)]
    pub descriptor: ExtensionDescriptor,
    pub kind: ExtensionKind,
    pub file_path: Option<PathBuf>,
    pub config: Value,
    pub loaded_at: DateTime<Utc>,
    pub circuit: CircuitStatus,
    pub stats: ExtensionStats,
    pub health: Option<HealthReport>,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub extension_id: String,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub extension_id: String,
    pub values: Vec<ExtensionMetricValue>,
    pub collected_at: DateTime<Utc>,
}

/// Extension commands exposed as callable tools.
#[async_trait]
pub trait ExtensionToolProvider: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Invoke a tool by its `{extension_id}_{command}` name.
    async fn invoke_tool(&self, name: &str, args: Value) -> Result<Value>;
}

pub struct ExtensionService {
    config: HostConfig,
    registry: ExtensionRegistry,
    supervisor: SafetySupervisor,
    health: RwLock<HashMap<String, HealthReport>>,
    metrics: RwLock<HashMap<String, MetricsSnapshot>>,
}

impl ExtensionService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            registry: ExtensionRegistry::new(&config),
            supervisor: SafetySupervisor::new(&config.safety),
            config,
            health: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &SafetySupervisor {
        &self.supervisor
    }

    /// Scan the configured extensions directory.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        self.discover_in(&self.config.extensions.dir).await
    }

    pub async fn discover_in(&self, dir: &Path) -> Result<DiscoveryReport> {
        let report = self.registry.discover(dir).await?;
        for id in report.reloaded.iter().chain(&report.loaded) {
            self.supervisor.reset(id);
            self.clear_caches(id);
        }
        for id in &report.removed {
            if !self.registry.contains(id).await {
                self.supervisor.forget(id);
            }
            self.clear_caches(id);
        }
        Ok(report)
    }

    /// Install an in-process extension.
    pub async fn register(&self, extension: Box<dyn Extension>) -> Result<Arc<ExtensionHandle>> {
        self.registry.register(extension).await
    }

    pub async fn list(&self) -> Vec<ExtensionSummary> {
        let health = self.health.read().clone();
        self.registry
            .list()
            .await
            .iter()
            .map(|handle| ExtensionSummary {
                metadata: handle.metadata().clone(),
                kind: handle.kind(),
                file_path: handle.path().map(Path::to_path_buf),
                loaded_at: handle.loaded_at(),
                healthy: health.get(handle.id()).map(|h| h.healthy),
                circuit_state: self.supervisor.circuit_status(handle.id()).state,
                metric_count: handle.metrics().len(),
                command_count: handle.commands().len(),
            })
            .collect()
    }

    pub async fn describe(&self, id: &str) -> Result<ExtensionDetails> {
        let handle = self.registry.get(id).await?;
        Ok(ExtensionDetails {
            descriptor: handle.descriptor(),
            kind: handle.kind(),
            file_path: handle.path().map(Path::to_path_buf),
            config: handle.config().clone(),
            loaded_at: handle.loaded_at(),
            circuit: self.supervisor.circuit_status(id),
            stats: self.supervisor.stats(id),
            health: self.health.read().get(id).cloned(),
            in_flight: handle.in_flight(),
        })
    }

    /// Validate `args` against the command's declared parameters and run it.
    pub async fn execute_command(&self, id: &str, command: &str, args: Value) -> Result<Value> {
        let handle = self.registry.get(id).await?;
        let args = match handle.command(command) {
            Some(definition) => definition.prepare_args(&args)?,
            None => {
                return Err(ExtensionError::CommandNotFound {
                    extension_id: id.to_string(),
                    command: command.to_string(),
                    available: handle.command_names(),
                })
            }
        };
        self.supervisor.execute_command(handle, command, args).await
    }

    /// Produce fresh metric values and cache them.
    pub async fn current_metrics(&self, id: &str) -> Result<MetricsSnapshot> {
        let handle = self.registry.get(id).await?;
        let values = self.supervisor.produce_metrics(handle.clone()).await?;
        let values = declared_only(&handle, values);
        let snapshot = MetricsSnapshot {
            extension_id: id.to_string(),
            values,
            collected_at: Utc::now(),
        };
        self.metrics
            .write()
            .insert(id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Last metric snapshot collected, if any.
    pub fn cached_metrics(&self, id: &str) -> Option<MetricsSnapshot> {
        self.metrics.read().get(id).cloned()
    }

    /// Run a supervised health check.
    ///
    /// Only an unknown id is an error; a failing or short-circuited check is
    /// reported as unhealthy.
    pub async fn health(&self, id: &str) -> Result<HealthReport> {
        let handle = self.registry.get(id).await?;
        let (healthy, error) = match self.supervisor.health_check(handle).await {
            Ok(healthy) => (healthy, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let report = HealthReport {
            extension_id: id.to_string(),
            healthy,
            checked_at: Utc::now(),
            error,
        };
        self.health.write().insert(id.to_string(), report.clone());
        Ok(report)
    }

    pub async fn get_config(&self, id: &str) -> Result<Value> {
        let handle = self.registry.get(id).await?;
        Ok(handle.config().clone())
    }

    /// Replace an extension's configuration and re-create it.
    pub async fn update_config(&self, id: &str, config: Value) -> Result<ExtensionDetails> {
        self.registry.update_config(id, config).await?;
        self.supervisor.reset(id);
        self.clear_caches(id);
        info!(extension_id = %id, "Extension configuration updated");
        self.describe(id).await
    }

    pub async fn unload(&self, id: &str) -> Result<()> {
        self.registry.unload(id).await?;
        self.supervisor.forget(id);
        self.clear_caches(id);
        Ok(())
    }

    pub async fn reload(&self, id: &str) -> Result<ExtensionDetails> {
        self.registry.reload(id).await?;
        self.supervisor.reset(id);
        self.clear_caches(id);
        self.describe(id).await
    }

    pub async fn reset_circuit(&self, id: &str) -> Result<CircuitStatus> {
        self.registry.get(id).await?;
        self.supervisor.reset(id);
        info!(extension_id = %id, "Circuit breaker reset");
        Ok(self.supervisor.circuit_status(id))
    }

    /// Every command of every loaded extension as a tool descriptor.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry
            .list()
            .await
            .iter()
            .flat_map(|handle| {
                handle
                    .commands()
                    .iter()
                    .map(|command| ToolDescriptor::for_command(handle.metadata(), command))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Resolve a tool name to its extension command and run it.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let target = self.registry.list().await.iter().find_map(|handle| {
            handle
                .commands()
                .iter()
                .find(|c| ToolDescriptor::tool_name(handle.id(), &c.name) == name)
                .map(|c| (handle.id().to_string(), c.name.clone()))
        });
        let (id, command) =
            target.ok_or_else(|| ExtensionError::NotFound(format!("tool {name}")))?;
        debug!(tool = %name, extension_id = %id, command = %command, "Resolved tool call");
        self.execute_command(&id, &command, args).await
    }

    /// Start the metric poller and, when configured, periodic re-discovery.
    ///
    /// Tasks stop when `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let poll_secs = self.config.extensions.metrics_poll_interval_secs;
        if poll_secs > 0 {
            let service = Arc::clone(self);
            tasks.push(spawn_periodic(
                "metrics_poller",
                Duration::from_secs(poll_secs),
                shutdown.clone(),
                move || {
                    let service = Arc::clone(&service);
                    async move { service.poll_metrics().await }
                },
            ));
        }

        let reload_secs = self.config.extensions.hot_reload_interval_secs;
        if reload_secs > 0 {
            let service = Arc::clone(self);
            tasks.push(spawn_periodic(
                "hot_reload",
                Duration::from_secs(reload_secs),
                shutdown,
                move || {
                    let service = Arc::clone(&service);
                    async move {
                        match service.discover().await {
                            Ok(report) if report.changed() => info!(
                                loaded = ?report.loaded,
                                reloaded = ?report.reloaded,
                                removed = ?report.removed,
                                "Hot reload applied changes"
                            ),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Hot reload scan failed"),
                        }
                    }
                },
            ));
        }

        tasks
    }

    /// Collect metrics from every loaded extension once.
    pub async fn poll_metrics(&self) {
        for handle in self.registry.list().await {
            if handle.metrics().is_empty() {
                continue;
            }
            match self.current_metrics(handle.id()).await {
                Ok(snapshot) => debug!(
                    extension_id = %handle.id(),
                    values = snapshot.values.len(),
                    "Polled extension metrics"
                ),
                Err(ExtensionError::CircuitOpen(_)) => {}
                Err(e) => warn!(extension_id = %handle.id(), error = %e, "Metric poll failed"),
            }
        }
    }

    fn clear_caches(&self, id: &str) {
        self.health.write().remove(id);
        self.metrics.write().remove(id);
    }
}

#[async_trait]
impl ExtensionToolProvider for ExtensionService {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools().await
    }

    async fn invoke_tool(&self, name: &str, args: Value) -> Result<Value> {
        self.call_tool(name, args).await
    }
}

/// Drop values for metrics the extension never declared, and coerce the
/// rest to the declared type. Values that cannot be coerced are dropped too.
fn declared_only(
    handle: &ExtensionHandle,
    values: Vec<ExtensionMetricValue>,
) -> Vec<ExtensionMetricValue> {
    values
        .into_iter()
        .filter_map(|mut value| {
            let coerced = handle
                .metrics()
                .iter()
                .find(|m| m.name == value.name)
                .and_then(|m| ParamMetricValue::from_json(&value.value.to_json(), m.data_type));
            match coerced {
                Some(coerced) => {
                    value.value = coerced;
                    Some(value)
                }
                None => {
                    debug!(
                        extension_id = %handle.id(),
                        metric = %value.name,
                        "Discarding undeclared metric value"
                    );
                    None
                }
            }
        })
        .collect()
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        info!(task = name, period_secs = period.as_secs(), "Background task started");

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(task = name, "Background task stopped");
    })
}
