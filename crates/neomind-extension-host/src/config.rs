//! Host configuration.
//!
//! Loaded from a TOML file where every field is optional, then overridden
//! from the environment. An empty file yields the defaults below.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values.
pub mod defaults {
    pub const EXTENSIONS_DIR: &str = "extensions";
    pub const COMMAND_TIMEOUT_SECS: u64 = 30;
    pub const FAILURE_THRESHOLD: u32 = 5;
    pub const MAX_CONCURRENT_CALLS: usize = 16;
    pub const WASM_MEMORY_LIMIT_MB: u64 = 100;
    pub const WASM_FUEL_PER_CALL: u64 = 10_000_000_000;
    pub const RESULT_BUFFER_BYTES: usize = 1024 * 1024;
    pub const METRICS_POLL_INTERVAL_SECS: u64 = 60;
    pub const HOT_RELOAD_INTERVAL_SECS: u64 = 0;
    pub const SERVER_BIND: &str = "0.0.0.0:9375";
    /// Smallest result buffer an operator may configure.
    pub const MIN_RESULT_BUFFER_BYTES: usize = 64;
}

/// Environment variable names.
pub mod env_vars {
    pub const EXTENSIONS_DIR: &str = "NEOMIND_EXTENSIONS_DIR";
    pub const COMMAND_TIMEOUT_SECS: &str = "NEOMIND_COMMAND_TIMEOUT_SECS";
    pub const WASM_MEMORY_MB: &str = "NEOMIND_WASM_MEMORY_MB";
    pub const HOST_BIND: &str = "NEOMIND_HOST_BIND";
    pub const LOG_JSON: &str = "NEOMIND_LOG_JSON";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub extensions: ExtensionsConfig,
    pub safety: SafetyConfig,
    pub wasm: WasmConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Directory scanned by discovery.
    pub dir: PathBuf,
    /// Size of the buffer extensions write command results into.
    pub result_buffer_bytes: usize,
    /// Metric polling period; 0 disables the poller.
    pub metrics_poll_interval_secs: u64,
    /// Re-discovery period; 0 disables hot reload.
    pub hot_reload_interval_secs: u64,
    /// Per-extension configuration blobs keyed by extension id.
    pub config: HashMap<String, serde_json::Value>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(defaults::EXTENSIONS_DIR),
            result_buffer_bytes: defaults::RESULT_BUFFER_BYTES,
            metrics_poll_interval_secs: defaults::METRICS_POLL_INTERVAL_SECS,
            hot_reload_interval_secs: defaults::HOT_RELOAD_INTERVAL_SECS,
            config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub command_timeout_secs: u64,
    /// Consecutive failures that open an extension's circuit.
    pub failure_threshold: u32,
    /// When set, an open circuit admits one trial call after this many seconds.
    pub breaker_cooldown_secs: Option<u64>,
    /// Calls allowed in flight per extension, abandoned calls included.
    pub max_concurrent_calls: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: defaults::COMMAND_TIMEOUT_SECS,
            failure_threshold: defaults::FAILURE_THRESHOLD,
            breaker_cooldown_secs: None,
            max_concurrent_calls: defaults::MAX_CONCURRENT_CALLS,
        }
    }
}

impl SafetyConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn breaker_cooldown(&self) -> Option<Duration> {
        self.breaker_cooldown_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    pub memory_limit_mb: u64,
    pub fuel_per_call: u64,
    /// Link WASI preview 1 imports into every module.
    pub allow_wasi: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: defaults::WASM_MEMORY_LIMIT_MB,
            fuel_per_call: defaults::WASM_FUEL_PER_CALL,
            allow_wasi: false,
        }
    }
}

impl WasmConfig {
    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::SERVER_BIND.to_string(),
        }
    }
}

impl HostConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply environment overrides and re-validate.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        self.validate()?;
        Ok(self)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(env_vars::EXTENSIONS_DIR) {
            self.extensions.dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(env_vars::COMMAND_TIMEOUT_SECS) {
            self.safety.command_timeout_secs =
                secs.trim().parse().map_err(|_| ConfigError::Invalid {
                    field: env_vars::COMMAND_TIMEOUT_SECS,
                    reason: format!("'{secs}' is not a number of seconds"),
                })?;
        }
        if let Some(mb) = lookup(env_vars::WASM_MEMORY_MB) {
            self.wasm.memory_limit_mb = mb.trim().parse().map_err(|_| ConfigError::Invalid {
                field: env_vars::WASM_MEMORY_MB,
                reason: format!("'{mb}' is not a number of megabytes"),
            })?;
        }
        if let Some(bind) = lookup(env_vars::HOST_BIND) {
            self.server.bind = bind;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "safety.command_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.safety.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "safety.failure_threshold",
                reason: "must be greater than zero".into(),
            });
        }
        if self.safety.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid {
                field: "safety.max_concurrent_calls",
                reason: "must be greater than zero".into(),
            });
        }
        if self.wasm.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid {
                field: "wasm.memory_limit_mb",
                reason: "must be greater than zero".into(),
            });
        }
        if self.extensions.result_buffer_bytes < defaults::MIN_RESULT_BUFFER_BYTES {
            return Err(ConfigError::Invalid {
                field: "extensions.result_buffer_bytes",
                reason: format!("must be at least {}", defaults::MIN_RESULT_BUFFER_BYTES),
            });
        }
        for (id, blob) in &self.extensions.config {
            if !blob.is_object() {
                return Err(ConfigError::Invalid {
                    field: "extensions.config",
                    reason: format!("configuration for '{id}' must be a table"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.safety.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.safety.failure_threshold, 5);
        assert_eq!(config.safety.breaker_cooldown(), None);
        assert_eq!(config.wasm.memory_limit_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_extension_config_tables() {
        let config = HostConfig::from_toml_str(
            r#"
            [extensions]
            dir = "/opt/neomind/extensions"

            [extensions.config."neomind.weather.forecast"]
            default_city = "Beijing"
            timeout_seconds = 10

            [safety]
            command_timeout_secs = 5
            breaker_cooldown_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.extensions.dir, PathBuf::from("/opt/neomind/extensions"));
        assert_eq!(config.safety.command_timeout_secs, 5);
        assert_eq!(config.safety.breaker_cooldown(), Some(Duration::from_secs(120)));
        let weather = &config.extensions.config["neomind.weather.forecast"];
        assert_eq!(weather["default_city"], "Beijing");
        assert_eq!(weather["timeout_seconds"], 10);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = HostConfig::from_toml_str("[safety]\ncommand_timeout_secs = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "safety.command_timeout_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HostConfig::default();
        config
            .apply_overrides(|key| match key {
                env_vars::EXTENSIONS_DIR => Some("/tmp/ext".to_string()),
                env_vars::COMMAND_TIMEOUT_SECS => Some("7".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.extensions.dir, PathBuf::from("/tmp/ext"));
        assert_eq!(config.safety.command_timeout_secs, 7);

        let err = config
            .apply_overrides(|key| {
                (key == env_vars::WASM_MEMORY_MB).then(|| "lots".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains(env_vars::WASM_MEMORY_MB));
    }
}
