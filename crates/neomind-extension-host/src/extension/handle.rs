//! Uniform wrapper around one loaded extension instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::error::Result;
use super::loader::LoadedExtension;
use super::system::{
    Extension, ExtensionCommand, ExtensionDescriptor, ExtensionKind, ExtensionMetadata,
    ExtensionMetricValue, MetricDescriptor,
};

/// File an extension was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSource {
    pub path: PathBuf,
    pub fingerprint: String,
}

/// One loaded extension.
///
/// Handles are shared behind `Arc`. The registry holds the owning reference;
/// in-flight calls hold clones, so the backing library or module is released
/// only after the last call returns.
///
/// Calls into the instance go through a reader/writer gate: metric
/// production and health checks share it, commands take it exclusively.
pub struct ExtensionHandle {
    extension: Box<dyn Extension>,
    kind: ExtensionKind,
    source: Option<ExtensionSource>,
    config: Value,
    loaded_at: DateTime<Utc>,
    gate: RwLock<()>,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
}

impl ExtensionHandle {
    pub fn new(
        extension: Box<dyn Extension>,
        source: Option<ExtensionSource>,
        config: Value,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            kind: extension.kind(),
            extension,
            source,
            config,
            loaded_at: Utc::now(),
            gate: RwLock::new(()),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub fn from_loaded(loaded: LoadedExtension, max_in_flight: usize) -> Self {
        Self::new(
            loaded.extension,
            Some(ExtensionSource {
                path: loaded.path,
                fingerprint: loaded.fingerprint,
            }),
            loaded.config,
            max_in_flight,
        )
    }

    pub fn id(&self) -> &str {
        &self.extension.metadata().id
    }

    pub fn metadata(&self) -> &ExtensionMetadata {
        self.extension.metadata()
    }

    pub fn metrics(&self) -> &[MetricDescriptor] {
        self.extension.metrics()
    }

    pub fn commands(&self) -> &[ExtensionCommand] {
        self.extension.commands()
    }

    pub fn command(&self, name: &str) -> Option<&ExtensionCommand> {
        self.commands().iter().find(|c| c.name == name)
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands().iter().map(|c| c.name.clone()).collect()
    }

    pub fn descriptor(&self) -> ExtensionDescriptor {
        ExtensionDescriptor {
            metadata: self.metadata().clone(),
            metrics: self.metrics().to_vec(),
            commands: self.commands().to_vec(),
        }
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn source(&self) -> Option<&ExtensionSource> {
        self.source.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.as_ref().map(|s| s.path.as_path())
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Calls currently holding a slot, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }

    pub(crate) fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.in_flight.clone().try_acquire_owned().ok()
    }

    pub(crate) fn run_command(&self, command: &str, args: &Value) -> Result<Value> {
        let _exclusive = self.gate.write();
        self.extension.execute_command(command, args)
    }

    pub(crate) fn run_produce_metrics(&self) -> Result<Vec<ExtensionMetricValue>> {
        let _shared = self.gate.read();
        self.extension.produce_metrics()
    }

    pub(crate) fn run_health_check(&self) -> Result<bool> {
        let _shared = self.gate.read();
        self.extension.health_check()
    }

    pub(crate) fn interrupt(&self) {
        self.extension.interrupt();
    }
}

impl std::fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl Drop for ExtensionHandle {
    fn drop(&mut self) {
        debug!(extension_id = %self.id(), kind = %self.kind, "Releasing extension handle");
    }
}
