//! Extension loaders for native and WASM extensions.
//!
//! Both loaders share the result envelope that extensions write into the
//! host-provided buffer:
//!
//! ```text
//! {"success": true,  "data": <any JSON>}
//! {"success": false, "error": "<message>"}
//! ```
//!
//! The extension returns the full envelope length. A length larger than the
//! buffer means the output was truncated and the call fails with
//! `BufferTooSmall`.

pub mod native;
pub mod sidecar;
pub mod wasm;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::HostConfig;
use crate::extension::error::{ExtensionError, Result};
use crate::extension::system::{Extension, ExtensionKind};
use crate::extension::{is_native_extension, is_wasm_extension};

pub use native::{NativeEntryPoints, NativeExtension, NativeExtensionLoader};
pub use sidecar::{read_sidecar, sidecar_path};
pub use wasm::{WasmExtension, WasmExtensionLoader, WasmLimits};

/// A freshly constructed extension, not yet registered.
pub struct LoadedExtension {
    pub extension: Box<dyn Extension>,
    pub path: PathBuf,
    /// SHA-256 over every file backing the extension.
    pub fingerprint: String,
    pub config: Value,
}

impl LoadedExtension {
    pub fn id(&self) -> &str {
        &self.extension.metadata().id
    }

    pub fn kind(&self) -> ExtensionKind {
        self.extension.kind()
    }
}

/// Dispatches a candidate file to the matching loader.
pub struct ExtensionLoader {
    native: NativeExtensionLoader,
    wasm: WasmExtensionLoader,
}

impl ExtensionLoader {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            native: NativeExtensionLoader::new(config.extensions.result_buffer_bytes),
            wasm: WasmExtensionLoader::new(WasmLimits::from_config(config)),
        }
    }

    /// Load the extension at `path`.
    ///
    /// `configs` maps extension ids to configuration blobs; the loader picks
    /// the entry matching the id the file declares.
    pub fn load(&self, path: &Path, configs: &HashMap<String, Value>) -> Result<LoadedExtension> {
        let fingerprint = fingerprint(path)?;

        let (extension, config): (Box<dyn Extension>, Value) = if is_wasm_extension(path) {
            let extension = self.wasm.load(path, configs)?;
            let config = extension.config().clone();
            (Box::new(extension), config)
        } else if is_native_extension(path) {
            let extension = self.native.load(path, configs)?;
            let config = extension.config().clone();
            (Box::new(extension), config)
        } else {
            return Err(ExtensionError::LoadFailed(format!(
                "{} is neither a native library nor a WASM module",
                path.display()
            )));
        };

        Ok(LoadedExtension {
            extension,
            path: path.to_path_buf(),
            fingerprint,
            config,
        })
    }
}

/// Hash the files backing the extension at `path`.
///
/// A WASM module is hashed together with its sidecar so editing either one
/// counts as a change.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(std::fs::read(path)?);
    if is_wasm_extension(path) {
        let sidecar = sidecar_path(path);
        if sidecar.exists() {
            hasher.update(std::fs::read(&sidecar)?);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Configuration blob for `id`; an empty object when none is configured.
pub(crate) fn config_for(id: &str, configs: &HashMap<String, Value>) -> Result<Value> {
    match configs.get(id) {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        Some(other) => Err(ExtensionError::InvalidConfig(format!(
            "configuration for {id} must be an object, got {other}"
        ))),
    }
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Decode the envelope an extension wrote into `buffer`.
///
/// `written` is the length the extension reported; only `buffer` is ever read.
pub(crate) fn read_envelope(buffer: &[u8], written: i64) -> Result<Value> {
    let needed = usize::try_from(written).map_err(|_| {
        ExtensionError::ExecutionFailed(format!("extension returned error code {written}"))
    })?;
    if needed > buffer.len() {
        return Err(ExtensionError::BufferTooSmall {
            needed,
            capacity: buffer.len(),
        });
    }

    let envelope: Envelope = serde_json::from_slice(&buffer[..needed]).map_err(|e| {
        ExtensionError::ExecutionFailed(format!("malformed result envelope: {e}"))
    })?;
    if envelope.success {
        Ok(envelope.data)
    } else {
        Err(ExtensionError::ExecutionFailed(
            envelope
                .error
                .unwrap_or_else(|| "extension reported failure without a message".to_string()),
        ))
    }
}
