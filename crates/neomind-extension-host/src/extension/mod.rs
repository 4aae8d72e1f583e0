//! Extension system for NeoMind.
//!
//! Extensions are dynamically loaded modules (.so/.dylib/.dll/.wasm) that add
//! metrics and commands to the host. Both flavours are hidden behind one
//! [`Extension`] interface and one supervised call path.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  ExtensionService                    │
//! │  - Validates arguments, caches metrics and health    │
//! └─────────────────────────────────────────────────────┘
//!          │                                │
//!          ▼                                ▼
//! ┌─────────────────────┐        ┌─────────────────────┐
//! │  ExtensionRegistry  │        │  SafetySupervisor   │
//! │  discovery, reload  │        │  timeout, breaker,  │
//! │  Arc<ExtensionHandle>│       │  panic containment  │
//! └─────────────────────┘        └─────────────────────┘
//!          │
//!          ├───────────────┬───────────────┐
//!          ▼               ▼               ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │ Native Ext  │ │  WASM Ext   │ │  Built-in   │
//!   │ (.so/.dll)  │ │ (.wasm+json)│ │  (in-proc)  │
//!   └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use neomind_extension_host::{ExtensionService, HostConfig};
//!
//! let service = ExtensionService::new(HostConfig::default());
//! let report = service.discover().await?;
//! let result = service
//!     .execute_command("weather-forecast", "query_weather", json!({"city": "Beijing"}))
//!     .await?;
//! ```

pub mod dispatch;
pub mod error;
pub mod handle;
pub mod loader;
pub mod registry;
pub mod safety;
pub mod supervisor;
pub mod system;

use std::path::Path;

pub use dispatch::{
    ExtensionDetails, ExtensionService, ExtensionSummary, ExtensionToolProvider, HealthReport,
    MetricsSnapshot,
};
pub use error::{ExtensionError, Result};
pub use handle::{ExtensionHandle, ExtensionSource};
pub use loader::{ExtensionLoader, LoadedExtension, NativeExtensionLoader, WasmExtensionLoader};
pub use registry::{DiscoveryReport, ExtensionRegistry, LoadFailure};
pub use safety::{
    install_extension_panic_hook, CircuitBreaker, CircuitState, CircuitStatus, SafetyManager,
};
pub use supervisor::{Operation, SafetySupervisor};
pub use system::{
    CExtensionMetadata, CommandDefinition, Extension, ExtensionCommand, ExtensionDescriptor,
    ExtensionKind, ExtensionMetadata, ExtensionMetricValue, ExtensionStats, MetricDataType,
    MetricDefinition, MetricDescriptor, ParamMetricValue, ParameterDefinition, ParameterGroup,
    ToolDescriptor, ABI_VERSION,
};

/// Whether `path` names a native shared library for this platform family.
pub fn is_native_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("so" | "dylib" | "dll")
    )
}

pub fn is_wasm_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("wasm")
}
