//! NeoMind extension host runtime.
//!
//! Discovers, loads, sandboxes and supervises third-party extensions that
//! ship either as native dynamic libraries or as WebAssembly modules.
//! The [`extension::ExtensionService`] is the surface consumed by the HTTP
//! server and the CLI.

pub mod config;
pub mod extension;

pub use config::{ConfigError, HostConfig};
pub use extension::{
    ExtensionError, ExtensionHandle, ExtensionRegistry, ExtensionService, Result,
    SafetySupervisor,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, HostConfig};
    pub use crate::extension::{
        CircuitState, Extension, ExtensionCommand, ExtensionDescriptor, ExtensionError,
        ExtensionHandle, ExtensionKind, ExtensionMetadata, ExtensionMetricValue,
        ExtensionRegistry, ExtensionService, MetricDataType, MetricDescriptor, ParamMetricValue,
        ParameterDefinition, Result, SafetySupervisor, ToolDescriptor, ABI_VERSION,
    };
}
