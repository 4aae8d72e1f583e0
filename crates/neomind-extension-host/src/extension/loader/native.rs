//! Native extension loader for .so/.dylib/.dll files.
//!
//! A native extension exports a fixed, version-gated set of C entry points.
//! Every entry point is declared `extern "C-unwind"` so a panic raised inside
//! the library unwinds back to the host, where it is caught and turned into an
//! error instead of aborting the process.
//!
//! | Symbol | Signature |
//! |---|---|
//! | `neomind_extension_abi_version` | `() -> u32` |
//! | `neomind_extension_metadata` | `() -> CExtensionMetadata` |
//! | `neomind_extension_create` | `(config: *const u8, len: usize) -> *mut c_void` |
//! | `neomind_extension_destroy` | `(instance: *mut c_void)` |
//! | `neomind_extension_metrics` | `(instance) -> *const c_char` (JSON array) |
//! | `neomind_extension_commands` | `(instance) -> *const c_char` (JSON array) |
//! | `neomind_extension_execute` | `(instance, command, args, args_len, out, out_cap) -> i64` |
//! | `neomind_extension_produce_metrics` | `(instance, out, out_cap) -> i64` |
//! | `neomind_extension_health_check` | `(instance) -> i32` |
//!
//! Strings returned by the library stay valid for the instance's lifetime;
//! the host copies everything it keeps.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr::NonNull;

use libloading::Library;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info};

use super::{config_for, read_envelope};
use crate::extension::error::{ExtensionError, Result};
use crate::extension::supervisor::panic_message;
use crate::extension::system::{
    CExtensionMetadata, Extension, ExtensionCommand, ExtensionDescriptor, ExtensionKind,
    ExtensionMetadata, ExtensionMetricValue, MetricDescriptor, ABI_VERSION,
};

pub type AbiVersionFn = unsafe extern "C-unwind" fn() -> u32;
pub type MetadataFn = unsafe extern "C-unwind" fn() -> CExtensionMetadata;
pub type CreateFn = unsafe extern "C-unwind" fn(*const u8, usize) -> *mut c_void;
pub type DestroyFn = unsafe extern "C-unwind" fn(*mut c_void);
pub type DescriptorsFn = unsafe extern "C-unwind" fn(*mut c_void) -> *const c_char;
pub type ExecuteFn = unsafe extern "C-unwind" fn(
    *mut c_void,
    *const c_char,
    *const u8,
    usize,
    *mut u8,
    usize,
) -> i64;
pub type ProduceMetricsFn = unsafe extern "C-unwind" fn(*mut c_void, *mut u8, usize) -> i64;
pub type HealthCheckFn = unsafe extern "C-unwind" fn(*mut c_void) -> i32;

/// Exported symbol names, NUL-terminated for `libloading`.
pub mod symbols {
    pub const ABI_VERSION: &[u8] = b"neomind_extension_abi_version\0";
    pub const METADATA: &[u8] = b"neomind_extension_metadata\0";
    pub const CREATE: &[u8] = b"neomind_extension_create\0";
    pub const DESTROY: &[u8] = b"neomind_extension_destroy\0";
    pub const METRICS: &[u8] = b"neomind_extension_metrics\0";
    pub const COMMANDS: &[u8] = b"neomind_extension_commands\0";
    pub const EXECUTE: &[u8] = b"neomind_extension_execute\0";
    pub const PRODUCE_METRICS: &[u8] = b"neomind_extension_produce_metrics\0";
    pub const HEALTH_CHECK: &[u8] = b"neomind_extension_health_check\0";
}

/// Resolved entry points of one native extension.
#[derive(Clone, Copy)]
pub struct NativeEntryPoints {
    pub abi_version: AbiVersionFn,
    pub metadata: MetadataFn,
    pub create: CreateFn,
    pub destroy: DestroyFn,
    pub metrics: DescriptorsFn,
    pub commands: DescriptorsFn,
    pub execute: ExecuteFn,
    pub produce_metrics: ProduceMetricsFn,
    pub health_check: HealthCheckFn,
}

impl NativeEntryPoints {
    /// Resolve every required symbol.
    ///
    /// # Safety
    ///
    /// The library must export each symbol with the signature declared in this
    /// module.
    pub unsafe fn resolve(library: &Library) -> Result<Self> {
        Ok(Self {
            abi_version: resolve_symbol(library, symbols::ABI_VERSION)?,
            metadata: resolve_symbol(library, symbols::METADATA)?,
            create: resolve_symbol(library, symbols::CREATE)?,
            destroy: resolve_symbol(library, symbols::DESTROY)?,
            metrics: resolve_symbol(library, symbols::METRICS)?,
            commands: resolve_symbol(library, symbols::COMMANDS)?,
            execute: resolve_symbol(library, symbols::EXECUTE)?,
            produce_metrics: resolve_symbol(library, symbols::PRODUCE_METRICS)?,
            health_check: resolve_symbol(library, symbols::HEALTH_CHECK)?,
        })
    }
}

unsafe fn resolve_symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    let symbol = library
        .get::<T>(name)
        .map_err(|e| ExtensionError::SymbolNotFound(format!("{}: {e}", symbol_name(name))))?;
    Ok(*symbol)
}

fn symbol_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned()
}

/// Run foreign code, turning a panic into `ExecutionFailed`.
fn guarded<T>(what: &str, call: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(call)).map_err(|payload| {
        ExtensionError::ExecutionFailed(format!(
            "extension panicked in {what}: {}",
            panic_message(payload.as_ref())
        ))
    })
}

/// Load-time faults are construction failures.
fn construction(err: ExtensionError) -> ExtensionError {
    match err {
        ExtensionError::ExecutionFailed(message) => ExtensionError::ConstructionFailed(message),
        other => other,
    }
}

fn check_abi_version(abi_version: AbiVersionFn) -> Result<()> {
    // SAFETY: fixed signature, no arguments.
    let got = guarded("abi_version", || unsafe { abi_version() }).map_err(construction)?;
    if got != ABI_VERSION {
        return Err(ExtensionError::AbiMismatch {
            expected: ABI_VERSION,
            got,
        });
    }
    Ok(())
}

/// # Safety
///
/// `ptr` is null or points to a NUL-terminated string.
unsafe fn c_string(field: &str, ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| Some(s.to_string()))
        .map_err(|e| ExtensionError::SchemaMismatch(format!("metadata field '{field}': {e}")))
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| ExtensionError::SchemaMismatch(format!("metadata field '{field}' is null")))
}

/// Copy the library's metadata record into owned values.
///
/// # Safety
///
/// Every non-null pointer in `raw` refers to a NUL-terminated string.
unsafe fn decode_metadata(
    raw: &CExtensionMetadata,
    path: Option<&Path>,
) -> Result<ExtensionMetadata> {
    if raw.abi_version != ABI_VERSION {
        return Err(ExtensionError::AbiMismatch {
            expected: ABI_VERSION,
            got: raw.abi_version,
        });
    }

    let version = required("version", c_string("version", raw.version)?)?;
    let version = semver::Version::parse(&version)
        .map_err(|e| ExtensionError::SchemaMismatch(format!("version '{version}': {e}")))?;

    Ok(ExtensionMetadata {
        id: required("id", c_string("id", raw.id)?)?,
        name: required("name", c_string("name", raw.name)?)?,
        version,
        description: c_string("description", raw.description)?,
        author: c_string("author", raw.author)?,
        homepage: c_string("homepage", raw.homepage)?,
        license: c_string("license", raw.license)?,
        file_path: path.map(Path::to_path_buf),
        config_parameters: None,
    })
}

/// A live instance created by a native library.
pub struct NativeExtension {
    descriptor: ExtensionDescriptor,
    config: Value,
    entry: NativeEntryPoints,
    instance: NonNull<c_void>,
    result_buffer_bytes: usize,
    // Dropped after `Drop::drop` has destroyed the instance.
    _library: Option<Library>,
}

// SAFETY: the ABI requires instances to tolerate calls from any thread. The
// handle gate serialises commands against every other call on the instance.
unsafe impl Send for NativeExtension {}
unsafe impl Sync for NativeExtension {}

impl NativeExtension {
    /// Build an extension from resolved entry points.
    ///
    /// `library` keeps the code mapped for as long as the instance lives; it is
    /// `None` when the entry points are linked into the host itself.
    pub fn from_entry_points(
        entry: NativeEntryPoints,
        library: Option<Library>,
        path: Option<&Path>,
        configs: &HashMap<String, Value>,
        result_buffer_bytes: usize,
    ) -> Result<Self> {
        check_abi_version(entry.abi_version)?;

        // SAFETY: fixed signature, no arguments.
        let raw = guarded("metadata", || unsafe { (entry.metadata)() }).map_err(construction)?;
        // SAFETY: the library keeps its metadata strings alive for the process lifetime.
        let (metadata, metric_count, command_count) = unsafe {
            (
                decode_metadata(&raw, path)?,
                raw.metric_count,
                raw.command_count,
            )
        };

        let config = config_for(&metadata.id, configs)?;
        let payload = serde_json::to_vec(&config)?;
        // SAFETY: payload outlives the call; the library copies what it keeps.
        let instance = guarded("create", || unsafe {
            (entry.create)(payload.as_ptr(), payload.len())
        })
        .map_err(construction)?;
        let instance = NonNull::new(instance).ok_or_else(|| {
            ExtensionError::ConstructionFailed(format!(
                "{} returned a null instance",
                metadata.id
            ))
        })?;

        // From here on Drop destroys the instance if anything below fails.
        let mut extension = Self {
            descriptor: ExtensionDescriptor {
                metadata,
                metrics: Vec::new(),
                commands: Vec::new(),
            },
            config,
            entry,
            instance,
            result_buffer_bytes,
            _library: library,
        };
        extension.descriptor.metrics =
            extension.read_descriptors::<MetricDescriptor>("metrics", entry.metrics, metric_count)?;
        extension.descriptor.commands =
            extension.read_descriptors::<ExtensionCommand>("commands", entry.commands, command_count)?;
        extension.descriptor.validate()?;

        Ok(extension)
    }

    /// Configuration blob passed to the constructor.
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    fn read_descriptors<T: DeserializeOwned>(
        &self,
        what: &str,
        accessor: DescriptorsFn,
        declared: usize,
    ) -> Result<Vec<T>> {
        let instance = self.instance.as_ptr();
        // SAFETY: instance is live; the returned string lives as long as it.
        let ptr = guarded(what, || unsafe { accessor(instance) }).map_err(construction)?;
        let items: Vec<T> = if ptr.is_null() {
            Vec::new()
        } else {
            // SAFETY: non-null pointers are NUL-terminated per the ABI.
            let json = unsafe { CStr::from_ptr(ptr) }
                .to_str()
                .map_err(|e| ExtensionError::SchemaMismatch(format!("{what}: {e}")))?;
            serde_json::from_str(json)
                .map_err(|e| ExtensionError::SchemaMismatch(format!("{what}: {e}")))?
        };

        if items.len() != declared {
            return Err(ExtensionError::SchemaMismatch(format!(
                "metadata declares {declared} {what}, library describes {}",
                items.len()
            )));
        }
        Ok(items)
    }
}

impl Extension for NativeExtension {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.descriptor.metadata
    }

    fn metrics(&self) -> &[MetricDescriptor] {
        &self.descriptor.metrics
    }

    fn commands(&self) -> &[ExtensionCommand] {
        &self.descriptor.commands
    }

    fn execute_command(&self, command: &str, args: &Value) -> Result<Value> {
        let command = CString::new(command).map_err(|_| {
            ExtensionError::InvalidArguments("command name contains a NUL byte".into())
        })?;
        let args = serde_json::to_vec(args)?;
        let mut out = vec![0u8; self.result_buffer_bytes];
        let capacity = out.len();
        let out_ptr = out.as_mut_ptr();
        let instance = self.instance.as_ptr();
        let execute = self.entry.execute;

        // SAFETY: all buffers outlive the call and their lengths are exact.
        let written = guarded("execute", || unsafe {
            execute(
                instance,
                command.as_ptr(),
                args.as_ptr(),
                args.len(),
                out_ptr,
                capacity,
            )
        })?;
        read_envelope(&out, written)
    }

    fn produce_metrics(&self) -> Result<Vec<ExtensionMetricValue>> {
        let mut out = vec![0u8; self.result_buffer_bytes];
        let capacity = out.len();
        let out_ptr = out.as_mut_ptr();
        let instance = self.instance.as_ptr();
        let produce = self.entry.produce_metrics;

        // SAFETY: out outlives the call and capacity is exact.
        let written = guarded("produce_metrics", || unsafe { produce(instance, out_ptr, capacity) })?;
        let data = read_envelope(&out, written)?;
        if data.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(data)
            .map_err(|e| ExtensionError::ExecutionFailed(format!("malformed metric values: {e}")))
    }

    fn health_check(&self) -> Result<bool> {
        let instance = self.instance.as_ptr();
        let health_check = self.entry.health_check;
        // SAFETY: instance is live.
        let status = guarded("health_check", || unsafe { health_check(instance) })?;
        Ok(status != 0)
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Native
    }
}

impl Drop for NativeExtension {
    fn drop(&mut self) {
        let destroy = self.entry.destroy;
        let instance = self.instance.as_ptr();
        // SAFETY: instance is non-null and this is the only destroy call.
        match guarded("destroy", || unsafe { destroy(instance) }) {
            Ok(()) => debug!(
                extension_id = %self.descriptor.metadata.id,
                "Native extension instance destroyed"
            ),
            Err(e) => error!(
                extension_id = %self.descriptor.metadata.id,
                error = %e,
                "Native extension destructor failed"
            ),
        }
    }
}

/// Loader for native extensions (.so, .dylib, .dll).
pub struct NativeExtensionLoader {
    result_buffer_bytes: usize,
}

impl NativeExtensionLoader {
    pub fn new(result_buffer_bytes: usize) -> Self {
        Self {
            result_buffer_bytes,
        }
    }

    /// Open the library, check its ABI version and construct an instance.
    pub fn load(&self, path: &Path, configs: &HashMap<String, Value>) -> Result<NativeExtension> {
        // SAFETY: opening a library runs its initialisers; extension files are
        // operator-installed and trusted to honour the ABI.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ExtensionError::LoadFailed(format!("{}: {e}", path.display())))?;

        // The version gate runs before anything else is resolved so that
        // libraries built for another ABI fail with AbiMismatch.
        // SAFETY: this symbol's signature is identical across ABI versions.
        let abi_version: AbiVersionFn =
            unsafe { resolve_symbol(&library, symbols::ABI_VERSION)? };
        check_abi_version(abi_version)?;

        // SAFETY: ABI version 2 fixes every signature in this module.
        let entry = unsafe { NativeEntryPoints::resolve(&library)? };
        let extension = NativeExtension::from_entry_points(
            entry,
            Some(library),
            Some(path),
            configs,
            self.result_buffer_bytes,
        )?;

        info!(
            extension_id = %extension.descriptor.metadata.id,
            version = %extension.descriptor.metadata.version,
            path = %path.display(),
            "Loaded native extension"
        );
        Ok(extension)
    }
}
