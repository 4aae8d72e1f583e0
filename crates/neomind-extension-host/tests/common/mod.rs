//! Shared fixtures: an in-process native extension that speaks the C ABI and
//! a WebAssembly weather module with its JSON sidecar.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use neomind_extension_host::config::HostConfig;
use neomind_extension_host::extension::loader::{NativeEntryPoints, NativeExtension};
use neomind_extension_host::extension::{CExtensionMetadata, Result};
use serde_json::{json, Value};

pub const WEATHER_ID: &str = "weather-forecast";

macro_rules! metrics_json {
    () => {
        r#"[{"name":"temperature","display_name":"Temperature","data_type":"float","unit":"°C","min":-50.0,"max":60.0}]"#
    };
}

macro_rules! commands_json {
    () => {
        r#"[
            {"name":"query_weather","display_name":"Query Weather","description":"Current weather for a city",
             "parameters":[{"name":"city","display_name":"City","param_type":"string","required":true}],
             "samples":[{"city":"Beijing"}],"llm_hints":"Use for weather questions"},
            {"name":"panic","display_name":"Panic"},
            {"name":"sleep","display_name":"Sleep",
             "parameters":[{"name":"ms","param_type":"integer","default_value":{"integer":50}}]},
            {"name":"trap","display_name":"Trap"},
            {"name":"loop_forever","display_name":"Loop Forever"},
            {"name":"grow_memory","display_name":"Grow Memory"},
            {"name":"big_result","display_name":"Big Result"}
        ]"#
    };
}

pub const COMMAND_COUNT: usize = 7;

pub fn command_names() -> Vec<String> {
    [
        "query_weather",
        "panic",
        "sleep",
        "trap",
        "loop_forever",
        "grow_memory",
        "big_result",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============================================================================
// Native fixture
// ============================================================================

/// Tags of destroyed native instances, in destruction order.
pub static DESTROYED: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub fn destroyed(tag: &str) -> bool {
    DESTROYED.lock().unwrap().iter().any(|t| t == tag)
}

struct Instance {
    tag: String,
}

static METRICS: &str = concat!(metrics_json!(), "\0");
static COMMANDS: &str = concat!(commands_json!(), "\0");

fn c(bytes: &'static [u8]) -> *const c_char {
    bytes.as_ptr() as *const c_char
}

extern "C-unwind" fn abi_version() -> u32 {
    2
}

extern "C-unwind" fn abi_version_v3() -> u32 {
    3
}

extern "C-unwind" fn metadata() -> CExtensionMetadata {
    CExtensionMetadata {
        abi_version: 2,
        id: c(b"weather-forecast\0"),
        name: c(b"Weather Forecast\0"),
        version: c(b"1.0.0\0"),
        description: c(b"Simulated weather data\0"),
        author: c(b"NeoMind\0"),
        homepage: std::ptr::null(),
        license: std::ptr::null(),
        metric_count: 1,
        command_count: COMMAND_COUNT,
    }
}

extern "C-unwind" fn create(config: *const u8, len: usize) -> *mut c_void {
    // SAFETY: the host passes a valid buffer of `len` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(config, len) };
    let Ok(config) = serde_json::from_slice::<Value>(bytes) else {
        return std::ptr::null_mut();
    };
    if config["fail"].as_bool() == Some(true) {
        return std::ptr::null_mut();
    }
    let tag = config["tag"].as_str().unwrap_or("untagged").to_string();
    Box::into_raw(Box::new(Instance { tag })) as *mut c_void
}

extern "C-unwind" fn destroy(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    // SAFETY: created by `create` above and destroyed once.
    let instance = unsafe { Box::from_raw(instance as *mut Instance) };
    DESTROYED.lock().unwrap().push(instance.tag);
}

extern "C-unwind" fn metrics(_instance: *mut c_void) -> *const c_char {
    METRICS.as_ptr() as *const c_char
}

extern "C-unwind" fn commands(_instance: *mut c_void) -> *const c_char {
    COMMANDS.as_ptr() as *const c_char
}

fn write_out(out: *mut u8, capacity: usize, body: &Value) -> i64 {
    let bytes = serde_json::to_vec(body).unwrap();
    if bytes.len() <= capacity {
        // SAFETY: the host buffer holds `capacity` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len()) };
    }
    bytes.len() as i64
}

extern "C-unwind" fn execute(
    instance: *mut c_void,
    command: *const c_char,
    args: *const u8,
    args_len: usize,
    out: *mut u8,
    capacity: usize,
) -> i64 {
    // SAFETY: the host passes a live instance and valid buffers.
    let (instance, command, args) = unsafe {
        (
            &*(instance as *const Instance),
            CStr::from_ptr(command).to_str().unwrap().to_string(),
            serde_json::from_slice::<Value>(std::slice::from_raw_parts(args, args_len)).unwrap(),
        )
    };

    let body = match command.as_str() {
        "query_weather" => match args["city"].as_str() {
            Some("Atlantis") => json!({"success": false, "error": "city not supported"}),
            Some(city) => json!({
                "success": true,
                "data": {"city": city, "temperature": 21.5, "tag": instance.tag}
            }),
            None => json!({"success": false, "error": "city missing"}),
        },
        "panic" => panic!("fixture exploded"),
        "sleep" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            json!({"success": true, "data": {"slept_ms": ms}})
        }
        "big_result" => return capacity as i64 + 1,
        other => json!({"success": false, "error": format!("unsupported command {other}")}),
    };
    write_out(out, capacity, &body)
}

extern "C-unwind" fn produce_metrics(_instance: *mut c_void, out: *mut u8, capacity: usize) -> i64 {
    let body = json!({
        "success": true,
        "data": [{"name": "temperature", "value": {"float": 21.5}, "timestamp": 0}]
    });
    write_out(out, capacity, &body)
}

extern "C-unwind" fn health_check(_instance: *mut c_void) -> i32 {
    1
}

pub fn native_entry_points() -> NativeEntryPoints {
    NativeEntryPoints {
        abi_version,
        metadata,
        create,
        destroy,
        metrics,
        commands,
        execute,
        produce_metrics,
        health_check,
    }
}

pub fn native_entry_points_v3() -> NativeEntryPoints {
    NativeEntryPoints {
        abi_version: abi_version_v3,
        ..native_entry_points()
    }
}

/// Construct the native fixture with `config` as its configuration blob.
pub fn native_extension(config: Value) -> Result<NativeExtension> {
    let configs = HashMap::from([(WEATHER_ID.to_string(), config)]);
    NativeExtension::from_entry_points(native_entry_points(), None, None, &configs, 4096)
}

// ============================================================================
// WASM fixture
// ============================================================================

const WEATHER_RESULT: &str = r#"{"success":true,"data":{"city":"Beijing","temperature":21.5}}"#;

pub fn weather_sidecar(version: &str) -> String {
    format!(
        r#"{{
            "id": "weather-forecast",
            "name": "Weather Forecast",
            "version": "{version}",
            "description": "Simulated weather data",
            "author": "NeoMind",
            "metrics": {},
            "commands": {}
        }}"#,
        metrics_json!(),
        commands_json!()
    )
}

/// Weather module: dispatches on the first byte of the command name.
///
/// `t` traps, `l` spins forever, `g` grows memory past any sane limit,
/// `b` reports one byte more than the buffer holds, anything else returns
/// the Beijing forecast.
pub fn weather_wat() -> String {
    let escaped = WEATHER_RESULT.replace('"', "\\\"");
    format!(
        r#"(module
            (memory (export "memory") 2)
            (global $heap (mut i32) (i32.const 4096))
            (data (i32.const 1024) "{escaped}")
            (func (export "neomind_extension_abi_version") (result i32) (i32.const 2))
            (func (export "alloc") (param $len i32) (result i32)
                (local $ptr i32) (local $end i32)
                (local.set $ptr (global.get $heap))
                (local.set $end (i32.add (local.get $ptr) (local.get $len)))
                (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
                    (then
                        (if (i32.eq
                                (memory.grow
                                    (i32.sub
                                        (i32.shr_u (i32.add (local.get $end) (i32.const 65535)) (i32.const 16))
                                        (memory.size)))
                                (i32.const -1))
                            (then unreachable))))
                (global.set $heap (local.get $end))
                (local.get $ptr))
            (func (export "dealloc") (param i32 i32)
                (global.set $heap (i32.const 4096)))
            (func (export "health") (result i32) (i32.const 1))
            (func (export "execute") (param $cmd i32) (param $args i32) (param $out i32) (param $cap i32) (result i32)
                (local $c i32) (local $n i32)
                (local.set $c (i32.load8_u (local.get $cmd)))
                (if (i32.eq (local.get $c) (i32.const 116)) (then unreachable))
                (if (i32.eq (local.get $c) (i32.const 108)) (then (loop $spin (br $spin))))
                (if (i32.eq (local.get $c) (i32.const 103))
                    (then
                        (if (i32.eq (memory.grow (i32.const 2000)) (i32.const -1))
                            (then unreachable))))
                (if (i32.eq (local.get $c) (i32.const 98))
                    (then (return (i32.add (local.get $cap) (i32.const 1)))))
                (local.set $n (i32.const {len}))
                (memory.copy
                    (local.get $out)
                    (i32.const 1024)
                    (select (local.get $n) (local.get $cap) (i32.le_u (local.get $n) (local.get $cap))))
                (local.get $n)))"#,
        len = WEATHER_RESULT.len()
    )
}

pub fn weather_wasm() -> Vec<u8> {
    wat::parse_str(weather_wat()).unwrap()
}

/// Write `<stem>.wasm` and, when given, `<stem>.json` into `dir`.
pub fn write_wasm(dir: &Path, stem: &str, wasm: &[u8], sidecar: Option<&str>) -> PathBuf {
    let path = dir.join(format!("{stem}.wasm"));
    std::fs::write(&path, wasm).unwrap();
    if let Some(sidecar) = sidecar {
        std::fs::write(dir.join(format!("{stem}.json")), sidecar).unwrap();
    }
    path
}

pub fn write_weather(dir: &Path) -> PathBuf {
    write_wasm(dir, "weather", &weather_wasm(), Some(&weather_sidecar("1.0.0")))
}

/// Host configuration pointed at `dir` with fast timeouts.
pub fn host_config(dir: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.extensions.dir = dir.to_path_buf();
    config.extensions.result_buffer_bytes = 4096;
    config.extensions.metrics_poll_interval_secs = 0;
    config.safety.command_timeout_secs = 1;
    config
}
