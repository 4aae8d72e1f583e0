//! WASM extension loader.
//!
//! A WASM extension is a `.wasm` module plus a same-named `.json` sidecar
//! carrying its descriptors. Each module gets its own wasmtime engine so an
//! epoch interrupt aimed at one extension never disturbs another.
//!
//! Required exports:
//! - `memory`
//! - `neomind_extension_abi_version() -> i32`
//! - `alloc(len) -> ptr`
//! - `execute(command_ptr, args_ptr, out_ptr, out_len) -> i32`
//! - `health() -> i32` (nonzero = healthy)
//!
//! Optional exports: `dealloc(ptr, len)`, `produce_metrics(out_ptr, out_len) -> i32`
//! and `configure(config_ptr) -> i32` (0 = accepted).
//!
//! The host obtains every buffer it uses from `alloc`, writes NUL-terminated
//! UTF-8 into the command, argument and configuration regions, and only
//! reads back from the output region it handed out.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, Instance, Linker, Memory, Module, ResourceLimiter, Store, Trap, TypedFunc,
    WasmParams, WasmResults,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use super::{config_for, read_envelope, read_sidecar};
use crate::config::HostConfig;
use crate::extension::error::{ExtensionError, Result};
use crate::extension::system::{
    Extension, ExtensionCommand, ExtensionDescriptor, ExtensionKind, ExtensionMetadata,
    ExtensionMetricValue, MetricDescriptor, ABI_VERSION,
};

const WASM_MAGIC: &[u8] = b"\0asm";
const MAX_TABLE_ELEMENTS: usize = 10_000;

mod exports {
    pub const MEMORY: &str = "memory";
    pub const ABI_VERSION: &str = "neomind_extension_abi_version";
    pub const ALLOC: &str = "alloc";
    pub const DEALLOC: &str = "dealloc";
    pub const EXECUTE: &str = "execute";
    pub const HEALTH: &str = "health";
    pub const PRODUCE_METRICS: &str = "produce_metrics";
    pub const CONFIGURE: &str = "configure";
}

/// Sandbox bounds applied to every WASM extension.
#[derive(Debug, Clone, PartialEq)]
pub struct WasmLimits {
    pub memory_limit_bytes: usize,
    pub fuel_per_call: u64,
    pub result_buffer_bytes: usize,
    pub allow_wasi: bool,
}

impl WasmLimits {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            memory_limit_bytes: config.wasm.memory_limit_bytes(),
            fuel_per_call: config.wasm.fuel_per_call,
            result_buffer_bytes: config.extensions.result_buffer_bytes,
            allow_wasi: config.wasm.allow_wasi,
        }
    }
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self::from_config(&HostConfig::default())
    }
}

struct MemoryLimiter {
    max_memory_bytes: usize,
    exceeded: bool,
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory_bytes {
            self.exceeded = true;
            debug!(
                current,
                desired,
                limit = self.max_memory_bytes,
                "Denied linear memory growth"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

struct HostState {
    limiter: MemoryLimiter,
    wasi: WasiP1Ctx,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    ptr: i32,
    len: i32,
}

impl Region {
    fn offset(&self) -> usize {
        self.ptr as usize
    }
}

/// Store plus the exports the host calls.
struct WasmInstance {
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
    execute: TypedFunc<(i32, i32, i32, i32), i32>,
    health: TypedFunc<(), i32>,
    produce_metrics: Option<TypedFunc<(i32, i32), i32>>,
}

impl WasmInstance {
    fn begin_call(&mut self, fuel: u64) -> Result<()> {
        self.store
            .set_fuel(fuel)
            .map_err(|e| ExtensionError::ExecutionFailed(format!("failed to set fuel: {e}")))?;
        self.store.set_epoch_deadline(1);
        self.store.data_mut().limiter.exceeded = false;
        Ok(())
    }

    fn classify(&self, err: wasmtime::Error, started: Instant) -> ExtensionError {
        classify_error(&self.store, err, started)
    }

    fn memory_exceeded(&self) -> Option<ExtensionError> {
        let limiter = &self.store.data().limiter;
        limiter.exceeded.then(|| {
            ExtensionError::ResourceExceeded(format!(
                "linear memory limit of {} bytes reached",
                limiter.max_memory_bytes
            ))
        })
    }

    fn alloc_region(&mut self, len: usize, started: Instant) -> Result<Region> {
        let len = i32::try_from(len).map_err(|_| {
            ExtensionError::ResourceExceeded(format!("{len} byte buffer exceeds guest address space"))
        })?;
        let alloc = self.alloc.clone();
        let ptr = alloc
            .call(&mut self.store, len)
            .map_err(|e| self.classify(e, started))?;

        let in_bounds = ptr >= 0
            && (ptr as usize)
                .checked_add(len as usize)
                .is_some_and(|end| end <= self.memory.data_size(&self.store));
        if !in_bounds {
            return Err(self.memory_exceeded().unwrap_or_else(|| {
                ExtensionError::ExecutionFailed(format!(
                    "guest allocator returned region {ptr}+{len} outside linear memory"
                ))
            }));
        }
        Ok(Region { ptr, len })
    }

    fn write_region(&mut self, bytes: &[u8], started: Instant) -> Result<Region> {
        let region = self.alloc_region(bytes.len(), started)?;
        self.memory
            .write(&mut self.store, region.offset(), bytes)
            .map_err(|e| ExtensionError::ExecutionFailed(format!("guest memory write: {e}")))?;
        Ok(region)
    }

    /// Read the first `len` bytes of a region the host allocated.
    fn read_region(&self, region: Region, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len.min(region.len as usize)];
        self.memory
            .read(&self.store, region.offset(), &mut buffer)
            .map_err(|e| ExtensionError::ExecutionFailed(format!("guest memory read: {e}")))?;
        Ok(buffer)
    }

    /// Decode an envelope the guest wrote into `out`.
    fn read_output(&self, out: Region, written: i32) -> Result<Value> {
        if let Some(err) = self.memory_exceeded() {
            return Err(err);
        }
        let capacity = out.len as usize;
        let needed = match usize::try_from(written) {
            Ok(needed) => needed,
            Err(_) => return read_envelope(&[], i64::from(written)),
        };
        if needed > capacity {
            return Err(ExtensionError::BufferTooSmall { needed, capacity });
        }
        let bytes = self.read_region(out, needed)?;
        read_envelope(&bytes, i64::from(written))
    }

    fn release(&mut self, regions: &[Region], fuel: u64) {
        let Some(dealloc) = self.dealloc.clone() else {
            return;
        };
        // A trapped call may have drained the fuel or hit the epoch deadline.
        if self.begin_call(fuel).is_err() {
            return;
        }
        for region in regions.iter().rev() {
            if let Err(e) = dealloc.call(&mut self.store, (region.ptr, region.len)) {
                debug!(error = %e, "Guest dealloc failed");
                break;
            }
        }
    }

    fn run_execute(
        &mut self,
        command: &[u8],
        args: &[u8],
        capacity: usize,
        regions: &mut Vec<Region>,
        started: Instant,
    ) -> Result<Value> {
        let command = self.write_region(command, started)?;
        regions.push(command);
        let args = self.write_region(args, started)?;
        regions.push(args);
        let out = self.alloc_region(capacity, started)?;
        regions.push(out);

        let execute = self.execute.clone();
        let written = execute
            .call(&mut self.store, (command.ptr, args.ptr, out.ptr, out.len))
            .map_err(|e| self.classify(e, started))?;
        self.read_output(out, written)
    }

    fn run_produce_metrics(
        &mut self,
        produce: TypedFunc<(i32, i32), i32>,
        capacity: usize,
        regions: &mut Vec<Region>,
        started: Instant,
    ) -> Result<Value> {
        let out = self.alloc_region(capacity, started)?;
        regions.push(out);
        let written = produce
            .call(&mut self.store, (out.ptr, out.len))
            .map_err(|e| self.classify(e, started))?;
        self.read_output(out, written)
    }
}

fn classify_error(store: &Store<HostState>, err: wasmtime::Error, started: Instant) -> ExtensionError {
    let limiter = &store.data().limiter;
    if limiter.exceeded {
        return ExtensionError::ResourceExceeded(format!(
            "linear memory limit of {} bytes reached",
            limiter.max_memory_bytes
        ));
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            ExtensionError::ResourceExceeded("execution fuel exhausted".to_string())
        }
        Some(Trap::Interrupt) => ExtensionError::Timeout(started.elapsed().as_millis() as u64),
        Some(trap) => ExtensionError::ModuleTrap(trap.to_string()),
        None => ExtensionError::ModuleTrap(format!("{err:#}")),
    }
}

fn nul_terminated(what: &str, text: &str) -> Result<Vec<u8>> {
    if text.as_bytes().contains(&0) {
        return Err(ExtensionError::InvalidArguments(format!(
            "{what} contains a NUL byte"
        )));
    }
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| ExtensionError::SymbolNotFound(format!("{name}: {e}")))
}

fn optional_export<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    if instance.get_export(&mut *store, name).is_none() {
        return Ok(None);
    }
    typed_export(instance, store, name).map(Some)
}

/// A sandboxed WASM extension instance.
pub struct WasmExtension {
    descriptor: ExtensionDescriptor,
    config: Value,
    engine: Engine,
    instance: Mutex<WasmInstance>,
    limits: WasmLimits,
}

impl WasmExtension {
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }
}

impl Extension for WasmExtension {
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
        let command = nul_terminated("command name", command)?;
        let args = nul_terminated("arguments", &serde_json::to_string(args)?)?;

        let mut instance = self.instance.lock();
        let started = Instant::now();
        instance.begin_call(self.limits.fuel_per_call)?;
        let mut regions = Vec::with_capacity(3);
        let outcome = instance.run_execute(
            &command,
            &args,
            self.limits.result_buffer_bytes,
            &mut regions,
            started,
        );
        instance.release(&regions, self.limits.fuel_per_call);
        outcome
    }

    fn produce_metrics(&self) -> Result<Vec<ExtensionMetricValue>> {
        let mut instance = self.instance.lock();
        let Some(produce) = instance.produce_metrics.clone() else {
            return Ok(Vec::new());
        };
        let started = Instant::now();
        instance.begin_call(self.limits.fuel_per_call)?;
        let mut regions = Vec::with_capacity(1);
        let outcome = instance.run_produce_metrics(
            produce,
            self.limits.result_buffer_bytes,
            &mut regions,
            started,
        );
        instance.release(&regions, self.limits.fuel_per_call);

        let data = outcome?;
        if data.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(data)
            .map_err(|e| ExtensionError::ExecutionFailed(format!("malformed metric values: {e}")))
    }

    fn health_check(&self) -> Result<bool> {
        let mut instance = self.instance.lock();
        let started = Instant::now();
        instance.begin_call(self.limits.fuel_per_call)?;
        let health = instance.health.clone();
        let status = health
            .call(&mut instance.store, ())
            .map_err(|e| instance.classify(e, started))?;
        if let Some(err) = instance.memory_exceeded() {
            return Err(err);
        }
        Ok(status != 0)
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Wasm
    }

    fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

/// Loader for `.wasm` + `.json` extension pairs.
pub struct WasmExtensionLoader {
    limits: WasmLimits,
}

impl WasmExtensionLoader {
    pub fn new(limits: WasmLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &WasmLimits {
        &self.limits
    }

    /// Parse the sidecar, instantiate the module and check its ABI version.
    pub fn load(&self, path: &Path, configs: &HashMap<String, Value>) -> Result<WasmExtension> {
        let descriptor = read_sidecar(path)?;
        let config = config_for(&descriptor.metadata.id, configs)?;

        let bytes = std::fs::read(path)?;
        if !bytes.starts_with(WASM_MAGIC) {
            return Err(ExtensionError::LoadFailed(format!(
                "{} is not a WebAssembly binary",
                path.display()
            )));
        }

        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| ExtensionError::LoadFailed(format!("wasm engine: {e}")))?;
        let module = Module::from_binary(&engine, &bytes)
            .map_err(|e| ExtensionError::LoadFailed(format!("{}: {e}", path.display())))?;

        let mut store = Store::new(
            &engine,
            HostState {
                limiter: MemoryLimiter {
                    max_memory_bytes: self.limits.memory_limit_bytes,
                    exceeded: false,
                },
                wasi: WasiCtxBuilder::new().build_p1(),
            },
        );
        store.limiter(|state| &mut state.limiter);
        store
            .set_fuel(self.limits.fuel_per_call)
            .map_err(|e| ExtensionError::LoadFailed(format!("failed to set fuel: {e}")))?;
        store.set_epoch_deadline(1);

        let mut linker: Linker<HostState> = Linker::new(&engine);
        if self.limits.allow_wasi {
            preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
                .map_err(|e| ExtensionError::LoadFailed(format!("wasi linker: {e}")))?;
        }

        let started = Instant::now();
        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(e) if store.data().limiter.exceeded => {
                return Err(classify_error(&store, e, started))
            }
            Err(e) => {
                return Err(ExtensionError::LoadFailed(format!(
                    "instantiate {}: {e:#}",
                    path.display()
                )))
            }
        };

        let abi_version: TypedFunc<(), i32> =
            typed_export(&instance, &mut store, exports::ABI_VERSION)?;
        let got = abi_version
            .call(&mut store, ())
            .map_err(|e| classify_error(&store, e, started))?;
        if got != ABI_VERSION as i32 {
            return Err(ExtensionError::AbiMismatch {
                expected: ABI_VERSION,
                got: got as u32,
            });
        }

        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or_else(|| ExtensionError::SymbolNotFound(exports::MEMORY.to_string()))?;
        let alloc = typed_export(&instance, &mut store, exports::ALLOC)?;
        let dealloc = optional_export(&instance, &mut store, exports::DEALLOC)?;
        let execute = typed_export(&instance, &mut store, exports::EXECUTE)?;
        let health = typed_export(&instance, &mut store, exports::HEALTH)?;
        let produce_metrics = optional_export(&instance, &mut store, exports::PRODUCE_METRICS)?;
        let configure: Option<TypedFunc<i32, i32>> =
            optional_export(&instance, &mut store, exports::CONFIGURE)?;

        let mut wasm_instance = WasmInstance {
            store,
            memory,
            alloc,
            dealloc,
            execute,
            health,
            produce_metrics,
        };

        if let Some(configure) = configure {
            let payload = nul_terminated("configuration", &serde_json::to_string(&config)?)?;
            wasm_instance.begin_call(self.limits.fuel_per_call)?;
            let region = wasm_instance
                .write_region(&payload, started)
                .map_err(as_construction)?;
            let code = configure
                .call(&mut wasm_instance.store, region.ptr)
                .map_err(|e| as_construction(wasm_instance.classify(e, started)))?;
            wasm_instance.release(&[region], self.limits.fuel_per_call);
            if code != 0 {
                return Err(ExtensionError::InvalidConfig(format!(
                    "{} rejected its configuration (code {code})",
                    descriptor.metadata.id
                )));
            }
        }

        info!(
            extension_id = %descriptor.metadata.id,
            version = %descriptor.metadata.version,
            path = %path.display(),
            memory_limit_bytes = self.limits.memory_limit_bytes,
            "Loaded WASM extension"
        );

        Ok(WasmExtension {
            descriptor,
            config,
            engine,
            instance: Mutex::new(wasm_instance),
            limits: self.limits.clone(),
        })
    }
}

fn as_construction(err: ExtensionError) -> ExtensionError {
    match err {
        ExtensionError::ModuleTrap(message) | ExtensionError::ExecutionFailed(message) => {
            ExtensionError::ConstructionFailed(message)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SIDECAR: &str = r#"{
        "id": "neomind.test.minimal",
        "name": "Minimal",
        "version": "0.1.0",
        "commands": [{"name": "ping"}]
    }"#;

    fn module(abi: i32, execute_body: &str) -> String {
        format!(
            r#"(module
                (memory (export "memory") 1)
                (global $heap (mut i32) (i32.const 1024))
                (func (export "neomind_extension_abi_version") (result i32) (i32.const {abi}))
                (func (export "alloc") (param $len i32) (result i32)
                    (local $ptr i32)
                    (local.set $ptr (global.get $heap))
                    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
                    (local.get $ptr))
                (func (export "health") (result i32) (i32.const 1))
                (func (export "execute") (param i32 i32 i32 i32) (result i32)
                    {execute_body}))"#
        )
    }

    fn write_pair(dir: &Path, wat_text: &str, sidecar: &str) -> PathBuf {
        let path = dir.join("minimal.wasm");
        std::fs::write(&path, wat::parse_str(wat_text).unwrap()).unwrap();
        std::fs::write(dir.join("minimal.json"), sidecar).unwrap();
        path
    }

    fn limits() -> WasmLimits {
        WasmLimits {
            memory_limit_bytes: 1024 * 1024,
            fuel_per_call: 10_000_000,
            result_buffer_bytes: 256,
            allow_wasi: false,
        }
    }

    #[test]
    fn test_abi_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pair(dir.path(), &module(3, "(i32.const 0)"), SIDECAR);
        let err = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::AbiMismatch { expected: 2, got: 3 }));
    }

    #[test]
    fn test_trap_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pair(dir.path(), &module(2, "unreachable"), SIDECAR);
        let extension = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .unwrap();

        let err = extension.execute_command("ping", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ExtensionError::ModuleTrap(_)));
        // The store survives the trap.
        assert!(extension.health_check().unwrap());
    }

    #[test]
    fn test_fuel_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pair(dir.path(), &module(2, "(loop $spin (br $spin)) (i32.const 0)"), SIDECAR);
        let extension = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .unwrap();

        let err = extension.execute_command("ping", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ExtensionError::ResourceExceeded(_)));
    }

    #[test]
    fn test_negative_length_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pair(dir.path(), &module(2, "(i32.const -1)"), SIDECAR);
        let extension = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .unwrap();

        let err = extension.execute_command("ping", &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, ExtensionError::ExecutionFailed(_)));
    }

    #[test]
    fn test_missing_export() {
        let dir = tempfile::tempdir().unwrap();
        let wat_text = r#"(module
            (memory (export "memory") 1)
            (func (export "neomind_extension_abi_version") (result i32) (i32.const 2)))"#;
        let path = write_pair(dir.path(), wat_text, SIDECAR);
        let err = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::SymbolNotFound(_)));
    }

    #[test]
    fn test_rejects_non_wasm_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minimal.wasm");
        std::fs::write(&path, b"(module)").unwrap();
        std::fs::write(dir.path().join("minimal.json"), SIDECAR).unwrap();
        let err = WasmExtensionLoader::new(limits())
            .load(&path, &HashMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::LoadFailed(_)));
    }

    #[test]
    fn test_nul_terminated() {
        assert_eq!(nul_terminated("x", "ab").unwrap(), b"ab\0");
        assert!(nul_terminated("x", "a\0b").is_err());
    }
}
