//! Extension error taxonomy.

use std::path::PathBuf;

/// Extension errors
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Incompatible ABI version: expected {expected}, got {got}")]
    AbiMismatch { expected: u32, got: u32 },

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Sidecar metadata file missing: {}", .0.display())]
    SidecarMissing(PathBuf),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Extension constructor failed: {0}")]
    ConstructionFailed(String),

    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Command '{command}' not found on {extension_id}; available: [{}]", .available.join(", "))]
    CommandNotFound {
        extension_id: String,
        command: String,
        available: Vec<String>,
    },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Module trap: {0}")]
    ModuleTrap(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Circuit open for extension {0}")]
    CircuitOpen(String),

    #[error("Result buffer too small: needed {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtensionError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AbiMismatch { .. } => "abi_mismatch",
            Self::SymbolNotFound(_) => "symbol_not_found",
            Self::SidecarMissing(_) => "sidecar_missing",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::InvalidConfig(_) => "invalid_config",
            Self::LoadFailed(_) => "load_failed",
            Self::ConstructionFailed(_) => "construction_failed",
            Self::NotFound(_) => "not_found",
            Self::CommandNotFound { .. } => "command_not_found",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::ModuleTrap(_) => "module_trap",
            Self::Timeout(_) => "timeout",
            Self::ResourceExceeded(_) => "resource_exceeded",
            Self::CircuitOpen(_) => "circuit_open",
            Self::BufferTooSmall { .. } => "buffer_too_small",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Unknown extension or unknown command.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::CommandNotFound { .. })
    }

    /// Whether a failed call should count against the extension's circuit.
    ///
    /// Caller mistakes and short-circuited calls never reach extension code.
    pub fn is_extension_fault(&self) -> bool {
        !matches!(
            self,
            Self::NotFound(_)
                | Self::CommandNotFound { .. }
                | Self::InvalidArguments(_)
                | Self::CircuitOpen(_)
        )
    }
}

/// Result type for extension operations
pub type Result<T> = std::result::Result<T, ExtensionError>;
