//! Extension descriptor model and the shared capability interface.
//!
//! Native libraries and WASM modules are both wrapped behind [`Extension`].
//! Their static descriptors (metadata, metrics, commands) are decoded once at
//! load time into the types below and never change for the lifetime of the
//! handle.
//!
//! # FFI Exports for Dynamic Loading
//!
//! Native extensions must export:
//! - `neomind_extension_abi_version()` -> u32
//! - `neomind_extension_metadata()` -> CExtensionMetadata
//! - `neomind_extension_create(config, len)` -> opaque instance
//! - `neomind_extension_destroy(instance)`
//! - `neomind_extension_metrics(instance)` / `neomind_extension_commands(instance)`
//! - `neomind_extension_execute(...)`, `neomind_extension_produce_metrics(...)`,
//!   `neomind_extension_health_check(instance)`
//!
//! See [`crate::extension::loader::native`] for the exact signatures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use super::error::{ExtensionError, Result};

// ============================================================================
// Core Types
// ============================================================================

/// ABI version for dynamic loading
/// Incremented when breaking changes are made to the extension interface
pub const ABI_VERSION: u32 = 2;

/// Metric data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDataType {
    Float,
    Integer,
    Boolean,
    #[default]
    String,
}

impl MetricDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::String => "string",
        }
    }

    /// JSON schema type name.
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            Self::Float => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::String => "string",
        }
    }

    /// Whether a JSON value carries this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Float => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::String => value.is_string(),
        }
    }
}

/// Parameter metric value (for command parameters and metric values).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMetricValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
    #[default]
    Null,
}

impl ParamMetricValue {
    pub fn data_type(&self) -> Option<MetricDataType> {
        match self {
            Self::Float(_) => Some(MetricDataType::Float),
            Self::Integer(_) => Some(MetricDataType::Integer),
            Self::Boolean(_) => Some(MetricDataType::Boolean),
            Self::String(_) => Some(MetricDataType::String),
            Self::Null => None,
        }
    }

    /// Plain JSON rendering, without the type tag.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Integer(i) => Value::from(*i),
            Self::Boolean(b) => Value::Bool(*b),
            Self::String(s) => Value::String(s.clone()),
            Self::Null => Value::Null,
        }
    }

    /// Interpret a plain JSON value as the given type.
    pub fn from_json(value: &Value, data_type: MetricDataType) -> Option<Self> {
        match (data_type, value) {
            (_, Value::Null) => Some(Self::Null),
            (MetricDataType::Float, v) => v.as_f64().map(Self::Float),
            (MetricDataType::Integer, v) => v.as_i64().map(Self::Integer),
            (MetricDataType::Boolean, Value::Bool(b)) => Some(Self::Boolean(*b)),
            (MetricDataType::String, Value::String(s)) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl From<f64> for ParamMetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamMetricValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for ParamMetricValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for ParamMetricValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ParamMetricValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Metric definition (matches device registry format).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub data_type: MetricDataType,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub required: bool,
}

/// Parameter definition for commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub param_type: MetricDataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<ParamMetricValue>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl ParameterDefinition {
    /// Check a supplied argument against this parameter's type, range and options.
    pub fn check(&self, value: &Value) -> Result<()> {
        if !self.param_type.accepts(value) {
            return Err(ExtensionError::InvalidArguments(format!(
                "parameter '{}' expects {}, got {}",
                self.name,
                self.param_type.as_str(),
                json_type_name(value)
            )));
        }
        if let Some(number) = value.as_f64() {
            if self.min.is_some_and(|min| number < min) || self.max.is_some_and(|max| number > max)
            {
                return Err(ExtensionError::InvalidArguments(format!(
                    "parameter '{}' = {} is outside [{}, {}]",
                    self.name,
                    number,
                    self.min.map_or("-inf".to_string(), |v| v.to_string()),
                    self.max.map_or("inf".to_string(), |v| v.to_string()),
                )));
            }
        }
        if let Some(text) = value.as_str() {
            if !self.options.is_empty() && !self.options.iter().any(|o| o == text) {
                return Err(ExtensionError::InvalidArguments(format!(
                    "parameter '{}' must be one of [{}], got '{}'",
                    self.name,
                    self.options.join(", "),
                    text
                )));
            }
        }
        Ok(())
    }
}

/// Parameter group for organizing command parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Command definition (matches device registry format).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload_template: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub fixed_values: HashMap<String, Value>,
    #[serde(default)]
    pub samples: Vec<Value>,
    #[serde(default)]
    pub llm_hints: String,
    #[serde(default)]
    pub parameter_groups: Vec<ParameterGroup>,
}

impl CommandDefinition {
    /// Validate caller arguments and produce the payload sent to the extension.
    ///
    /// Defaults fill absent parameters, then fixed values overwrite whatever
    /// the caller supplied for the same keys.
    pub fn prepare_args(&self, args: &Value) -> Result<Value> {
        let mut payload = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ExtensionError::InvalidArguments(format!(
                    "command '{}' expects an object of arguments, got {}",
                    self.name,
                    json_type_name(other)
                )))
            }
        };

        for param in &self.parameters {
            match payload.get(&param.name) {
                None | Some(Value::Null) => {
                    if let Some(default) = &param.default_value {
                        payload.insert(param.name.clone(), default.to_json());
                    } else if param.required {
                        return Err(ExtensionError::InvalidArguments(format!(
                            "missing required parameter '{}' for command '{}'",
                            param.name, self.name
                        )));
                    }
                }
                Some(value) => param.check(value)?,
            }
        }

        for (key, value) in &self.fixed_values {
            payload.insert(key.clone(), value.clone());
        }

        Ok(Value::Object(payload))
    }

    /// JSON schema describing this command's parameters.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut schema = serde_json::json!({
                "type": param.param_type.json_schema_type(),
                "description": param.description,
            });
            if !param.options.is_empty() {
                schema["enum"] = serde_json::json!(param.options);
            }
            if let Some(min) = param.min {
                schema["minimum"] = serde_json::json!(min);
            }
            if let Some(max) = param.max {
                schema["maximum"] = serde_json::json!(max);
            }
            if let Some(default) = &param.default_value {
                schema["default"] = default.to_json();
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(param.name.clone());
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Metric descriptor for extensions - uses MetricDefinition
pub type MetricDescriptor = MetricDefinition;

/// Command descriptor for extensions - uses CommandDefinition
pub type ExtensionCommand = CommandDefinition;

// ============================================================================
// Extension Trait
// ============================================================================

/// Backing technology of a loaded extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Native,
    Wasm,
    /// Compiled into the host process.
    Builtin,
}

impl std::fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Wasm => write!(f, "wasm"),
            Self::Builtin => write!(f, "builtin"),
        }
    }
}

/// The capability set every loaded extension exposes.
///
/// Descriptor accessors return immediately. `execute_command`,
/// `produce_metrics` and `health_check` may block; the safety supervisor
/// always runs them on the blocking pool behind a deadline.
pub trait Extension: Send + Sync {
    /// Get extension metadata
    fn metadata(&self) -> &ExtensionMetadata;

    /// Declare metrics provided by this extension
    fn metrics(&self) -> &[MetricDescriptor];

    /// Declare commands provided by this extension
    fn commands(&self) -> &[ExtensionCommand];

    /// Execute a command with already-validated arguments.
    fn execute_command(&self, command: &str, args: &Value) -> Result<Value>;

    /// Current metric values.
    fn produce_metrics(&self) -> Result<Vec<ExtensionMetricValue>> {
        Ok(Vec::new())
    }

    fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Builtin
    }

    /// Ask a running call to stop. Only sandboxed backends can honour this.
    fn interrupt(&self) {}
}

/// Metric value with name for extensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMetricValue {
    pub name: String,
    pub value: ParamMetricValue,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ExtensionMetricValue {
    pub fn new(name: impl Into<String>, value: ParamMetricValue) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Extension metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Unique extension identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Extension version
    pub version: semver::Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// File path (not serialized)
    #[serde(skip)]
    pub file_path: Option<std::path::PathBuf>,
    /// Configuration values the extension accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_parameters: Option<Vec<ParameterDefinition>>,
}

impl ExtensionMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
            description: None,
            author: None,
            homepage: None,
            license: None,
            file_path: None,
            config_parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = Some(homepage.into());
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_config_parameters(mut self, config_parameters: Vec<ParameterDefinition>) -> Self {
        self.config_parameters = Some(config_parameters);
        self
    }
}

/// Metadata plus both descriptor lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub metadata: ExtensionMetadata,
    #[serde(default)]
    pub metrics: Vec<MetricDescriptor>,
    #[serde(default)]
    pub commands: Vec<ExtensionCommand>,
}

impl ExtensionDescriptor {
    /// Structural checks shared by every loader. Violations are `SchemaMismatch`.
    pub fn validate(&self) -> Result<()> {
        validate_extension_id(&self.metadata.id)?;
        if self.metadata.name.trim().is_empty() {
            return Err(schema(format!("extension {} has an empty name", self.metadata.id)));
        }

        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if metric.name.is_empty() {
                return Err(schema("metric with empty name".into()));
            }
            if !metric_names.insert(metric.name.as_str()) {
                return Err(schema(format!("duplicate metric '{}'", metric.name)));
            }
            check_range(&metric.name, metric.min, metric.max)?;
        }

        let mut command_names = HashSet::new();
        for command in &self.commands {
            if command.name.is_empty() {
                return Err(schema("command with empty name".into()));
            }
            if !command_names.insert(command.name.as_str()) {
                return Err(schema(format!("duplicate command '{}'", command.name)));
            }

            let mut param_names = HashSet::new();
            for param in &command.parameters {
                if !param_names.insert(param.name.as_str()) {
                    return Err(schema(format!(
                        "duplicate parameter '{}' in command '{}'",
                        param.name, command.name
                    )));
                }
                check_range(&param.name, param.min, param.max)?;
                if let Some(data_type) = param.default_value.as_ref().and_then(|v| v.data_type()) {
                    if data_type != param.param_type {
                        return Err(schema(format!(
                            "default for parameter '{}' is {}, declared {}",
                            param.name,
                            data_type.as_str(),
                            param.param_type.as_str()
                        )));
                    }
                }
            }

            for group in &command.parameter_groups {
                if let Some(unknown) = group
                    .parameters
                    .iter()
                    .find(|name| !param_names.contains(name.as_str()))
                {
                    return Err(schema(format!(
                        "group '{}' of command '{}' references unknown parameter '{}'",
                        group.name, command.name, unknown
                    )));
                }
            }
        }

        Ok(())
    }
}

fn schema(message: String) -> ExtensionError {
    ExtensionError::SchemaMismatch(message)
}

fn check_range(name: &str, min: Option<f64>, max: Option<f64>) -> Result<()> {
    match (min, max) {
        (Some(min), Some(max)) if min > max => Err(schema(format!(
            "'{name}' declares min {min} greater than max {max}"
        ))),
        _ => Ok(()),
    }
}

/// Ids follow the reverse-domain convention: ASCII alphanumerics, `.`, `-`, `_`.
pub fn validate_extension_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(schema("extension id is empty".into()));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(schema(format!(
            "extension id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Extension Statistics
// ============================================================================

/// Extension statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionStats {
    pub commands_executed: u64,
    pub metrics_produced: u64,
    pub health_checks: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub total_execution_time_ms: u64,
    pub last_execution_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// FFI Types for Dynamic Loading
// ============================================================================

/// C-compatible extension metadata for FFI (V2)
#[repr(C)]
pub struct CExtensionMetadata {
    /// ABI version
    pub abi_version: u32,
    /// Extension ID (null-terminated string)
    pub id: *const std::ffi::c_char,
    /// Extension name (null-terminated string)
    pub name: *const std::ffi::c_char,
    /// Version string (null-terminated string)
    pub version: *const std::ffi::c_char,
    /// Description (null-terminated string, can be null)
    pub description: *const std::ffi::c_char,
    /// Author (null-terminated string, can be null)
    pub author: *const std::ffi::c_char,
    /// Homepage (null-terminated string, can be null)
    pub homepage: *const std::ffi::c_char,
    /// License (null-terminated string, can be null)
    pub license: *const std::ffi::c_char,
    /// Number of metrics
    pub metric_count: usize,
    /// Number of commands
    pub command_count: usize,
}

// ============================================================================
// Tool Descriptor
// ============================================================================

/// Tool descriptor for extension commands.
///
/// This represents an extension command as a callable tool for AI agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name ("{extension_id}_{command}")
    pub name: String,
    pub description: String,
    /// Input parameters schema (JSON Schema)
    pub parameters: Value,
    pub returns: Option<String>,
    pub extension_id: String,
    pub command: String,
}

impl ToolDescriptor {
    pub fn tool_name(extension_id: &str, command: &str) -> String {
        format!("{extension_id}_{command}")
    }

    pub fn for_command(metadata: &ExtensionMetadata, command: &ExtensionCommand) -> Self {
        let mut description = if command.description.is_empty() {
            command.display_name.clone()
        } else {
            command.description.clone()
        };
        if !command.llm_hints.is_empty() {
            if !description.is_empty() {
                description.push_str(". ");
            }
            description.push_str(&command.llm_hints);
        }

        Self {
            name: Self::tool_name(&metadata.id, &command.name),
            description,
            parameters: command.parameters_schema(),
            returns: Some(format!("Result of {} from {}", command.name, metadata.name)),
            extension_id: metadata.id.clone(),
            command: command.name.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
