//! API handlers organized by domain.

pub mod basic;
pub mod common;
pub mod extensions;

// Re-export ServerState so handlers can use it
pub use crate::server::ServerState;

pub use basic::health_handler;
pub use extensions::{
    discover_extensions_handler, execute_extension_command_handler, extension_health_handler,
    extension_metrics_handler, get_extension_config_handler, get_extension_handler,
    list_extension_tools_handler, list_extensions_handler, reload_extension_handler,
    reset_extension_circuit_handler, unload_extension_handler, update_extension_config_handler,
};
