//! Extension registry: the sole owner of loaded extension handles.
//!
//! Lookups clone an `Arc` out of a locked map and never hold the lock across
//! a call. Replacement swaps the map entry in one write, so a concurrent
//! lookup sees either the old handle or the new one. Loading runs on the
//! blocking pool and never under the map lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::error::{ExtensionError, Result};
use super::handle::ExtensionHandle;
use super::loader::{self, ExtensionLoader, LoadedExtension};
use super::system::{Extension, ExtensionMetadata};
use super::{is_native_extension, is_wasm_extension};
use crate::config::HostConfig;

/// One candidate that could not be loaded.
#[derive(Debug)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: ExtensionError,
}

impl Serialize for LoadFailure {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("LoadFailure", 3)?;
        state.serialize_field("path", &self.path)?;
        state.serialize_field("code", self.error.kind())?;
        state.serialize_field("message", &self.error.to_string())?;
        state.end()
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Default, Serialize)]
pub struct DiscoveryReport {
    /// Newly loaded extension ids.
    pub loaded: Vec<String>,
    /// Ids whose backing file changed and were swapped for a fresh instance.
    pub reloaded: Vec<String>,
    /// Ids whose backing file is unchanged.
    pub unchanged: Vec<String>,
    /// Ids whose backing file disappeared.
    pub removed: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

impl DiscoveryReport {
    fn fail(&mut self, path: &Path, error: ExtensionError) {
        warn!(path = %path.display(), error = %error, "Failed to load extension");
        self.failures.push(LoadFailure {
            path: path.to_path_buf(),
            error,
        });
    }

    /// Whether the pass changed the live set.
    pub fn changed(&self) -> bool {
        !(self.loaded.is_empty() && self.reloaded.is_empty() && self.removed.is_empty())
    }
}

/// Registry for managing extensions.
pub struct ExtensionRegistry {
    extensions: RwLock<HashMap<String, Arc<ExtensionHandle>>>,
    configs: parking_lot::RwLock<HashMap<String, Value>>,
    loader: Arc<ExtensionLoader>,
    /// Serialises discovery, reload and reconfiguration.
    lifecycle: Mutex<()>,
    max_in_flight: usize,
}

impl ExtensionRegistry {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            extensions: RwLock::new(HashMap::new()),
            configs: parking_lot::RwLock::new(config.extensions.config.clone()),
            loader: Arc::new(ExtensionLoader::new(config)),
            lifecycle: Mutex::new(()),
            max_in_flight: config.safety.max_concurrent_calls,
        }
    }

    /// Install an in-process extension.
    pub async fn register(&self, extension: Box<dyn Extension>) -> Result<Arc<ExtensionHandle>> {
        let id = extension.metadata().id.clone();
        let config = self.config(&id);
        let handle = Arc::new(ExtensionHandle::new(
            extension,
            None,
            config,
            self.max_in_flight,
        ));

        let mut extensions = self.extensions.write().await;
        if extensions.contains_key(&id) {
            return Err(ExtensionError::AlreadyRegistered(id));
        }
        extensions.insert(id.clone(), handle.clone());
        info!(extension_id = %id, kind = %handle.kind(), "Registered extension");
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<ExtensionHandle>> {
        self.extensions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<ExtensionHandle>> {
        let mut handles: Vec<_> = self.extensions.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub async fn list_metadata(&self) -> Vec<ExtensionMetadata> {
        self.list()
            .await
            .iter()
            .map(|h| h.metadata().clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.extensions.read().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.extensions.read().await.contains_key(id)
    }

    /// Configuration blob for `id`; an empty object when none is set.
    pub fn config(&self, id: &str) -> Value {
        self.configs
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Remove an extension from the live set.
    ///
    /// The instance is torn down once the last in-flight call drops its
    /// reference to the handle.
    pub async fn unload(&self, id: &str) -> Result<()> {
        let removed = self.extensions.write().await.remove(id);
        match removed {
            Some(handle) => {
                info!(
                    extension_id = %id,
                    in_flight = handle.in_flight(),
                    "Unloaded extension"
                );
                Ok(())
            }
            None => Err(ExtensionError::NotFound(id.to_string())),
        }
    }

    /// Load a single file and add it to the live set.
    pub async fn load_from_path(&self, path: &Path) -> Result<Arc<ExtensionHandle>> {
        let _lifecycle = self.lifecycle.lock().await;
        let path = std::fs::canonicalize(path)?;
        let loaded = self.load_file(&path).await?;
        let handle = Arc::new(ExtensionHandle::from_loaded(loaded, self.max_in_flight));
        let id = handle.id().to_string();

        let mut extensions = self.extensions.write().await;
        if let Some(existing) = extensions.get(&id) {
            return Err(already_registered(&id, existing));
        }
        extensions.insert(id, handle.clone());
        Ok(handle)
    }

    /// Re-create an extension from its file with the current configuration.
    pub async fn reload(&self, id: &str) -> Result<Arc<ExtensionHandle>> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.get(id).await?;
        self.reload_handle(&current).await
    }

    /// Store a new configuration blob and re-create the extension with it.
    ///
    /// When the new instance fails to construct, the old handle and the old
    /// configuration stay in place.
    pub async fn update_config(&self, id: &str, config: Value) -> Result<Arc<ExtensionHandle>> {
        if !config.is_object() {
            return Err(ExtensionError::InvalidConfig(format!(
                "configuration for {id} must be a JSON object"
            )));
        }

        let _lifecycle = self.lifecycle.lock().await;
        let current = self.get(id).await?;
        if current.path().is_none() {
            return Err(ExtensionError::InvalidConfig(format!(
                "built-in extension {id} cannot be reconfigured"
            )));
        }

        let previous = self.configs.write().insert(id.to_string(), config);
        match self.reload_handle(&current).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let mut configs = self.configs.write();
                match previous {
                    Some(previous) => configs.insert(id.to_string(), previous),
                    None => configs.remove(id),
                };
                warn!(extension_id = %id, error = %e, "Configuration rejected, keeping previous instance");
                Err(e)
            }
        }
    }

    async fn reload_handle(&self, current: &Arc<ExtensionHandle>) -> Result<Arc<ExtensionHandle>> {
        let id = current.id().to_string();
        let path = current.path().map(Path::to_path_buf).ok_or_else(|| {
            ExtensionError::LoadFailed(format!("{id} is built in and has no backing file"))
        })?;

        let loaded = self.load_file(&path).await?;
        if loaded.id() != id {
            return Err(ExtensionError::SchemaMismatch(format!(
                "{} now declares id {}, expected {id}",
                path.display(),
                loaded.id()
            )));
        }

        let handle = Arc::new(ExtensionHandle::from_loaded(loaded, self.max_in_flight));
        let previous = self
            .extensions
            .write()
            .await
            .insert(id.clone(), handle.clone());
        drop(previous);
        info!(extension_id = %id, path = %path.display(), "Reloaded extension");
        Ok(handle)
    }

    /// Scan `dir`, loading new files, reloading changed ones and unloading
    /// extensions whose files disappeared.
    ///
    /// A failing candidate is recorded in the report and never stops the
    /// remaining candidates from loading.
    pub async fn discover(&self, dir: &Path) -> Result<DiscoveryReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut report = DiscoveryReport::default();

        if !dir.is_dir() {
            warn!(dir = %dir.display(), "Extensions directory does not exist");
            return Ok(report);
        }
        let dir = std::fs::canonicalize(dir)?;
        let candidates = scan_dir(&dir)?;

        let known: HashMap<PathBuf, Arc<ExtensionHandle>> = self
            .extensions
            .read()
            .await
            .values()
            .filter_map(|h| h.path().map(|p| (p.to_path_buf(), h.clone())))
            .collect();

        for path in &candidates {
            let existing = known.get(path);
            let fingerprint = match loader::fingerprint(path) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    report.fail(path, e);
                    continue;
                }
            };
            if let Some(handle) = existing {
                if handle.source().is_some_and(|s| s.fingerprint == fingerprint) {
                    report.unchanged.push(handle.id().to_string());
                    continue;
                }
            }

            let loaded = match self.load_file(path).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    report.fail(path, e);
                    continue;
                }
            };
            let handle = Arc::new(ExtensionHandle::from_loaded(loaded, self.max_in_flight));
            let id = handle.id().to_string();

            let mut extensions = self.extensions.write().await;
            if let Some(other) = extensions.get(&id) {
                let same_entry = existing.is_some_and(|old| Arc::ptr_eq(old, other));
                if !same_entry {
                    let error = already_registered(&id, other);
                    drop(extensions);
                    report.fail(path, error);
                    continue;
                }
            }

            let mut displaced = Vec::new();
            match existing {
                Some(old) if old.id() == id => report.reloaded.push(id.clone()),
                Some(old) => {
                    // Same file, new identity.
                    displaced.extend(extensions.remove(old.id()));
                    report.removed.push(old.id().to_string());
                    report.loaded.push(id.clone());
                }
                None => report.loaded.push(id.clone()),
            }
            displaced.extend(extensions.insert(id, handle));
            drop(extensions);
            drop(displaced);
        }

        let mut displaced = Vec::new();
        {
            let mut extensions = self.extensions.write().await;
            for (path, handle) in &known {
                if path.parent() != Some(dir.as_path()) || candidates.contains(path) {
                    continue;
                }
                let still_live = extensions
                    .get(handle.id())
                    .is_some_and(|live| Arc::ptr_eq(live, handle));
                if still_live {
                    displaced.extend(extensions.remove(handle.id()));
                    info!(extension_id = %handle.id(), path = %path.display(), "Extension file removed, unloaded");
                    report.removed.push(handle.id().to_string());
                }
            }
        }
        drop(displaced);

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            reloaded = report.reloaded.len(),
            unchanged = report.unchanged.len(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            "Extension discovery complete"
        );
        Ok(report)
    }

    async fn load_file(&self, path: &Path) -> Result<LoadedExtension> {
        let loader = self.loader.clone();
        let configs = self.configs.read().clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || loader.load(&path, &configs))
            .await
            .map_err(|e| ExtensionError::LoadFailed(format!("loader task failed: {e}")))?
    }
}

fn already_registered(id: &str, existing: &ExtensionHandle) -> ExtensionError {
    let origin = existing
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "a built-in extension".to_string());
    ExtensionError::AlreadyRegistered(format!("{id} is already loaded from {origin}"))
}

/// Candidate files in `dir`: native libraries and `.wasm` modules.
///
/// Stray `.json` files are ignored; a `.wasm` without its sidecar is still a
/// candidate so that the missing sidecar is reported.
fn scan_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && (is_native_extension(&path) || is_wasm_extension(&path)) {
            candidates.push(path);
        }
    }
    candidates.sort();
    Ok(candidates)
}
