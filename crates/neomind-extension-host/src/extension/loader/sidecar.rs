//! JSON sidecar carrying a WASM extension's descriptors.
//!
//! `weather.wasm` is described by `weather.json` in the same directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::extension::error::{ExtensionError, Result};
use crate::extension::system::{
    ExtensionCommand, ExtensionDescriptor, ExtensionMetadata, MetricDescriptor,
    ParameterDefinition,
};

#[derive(Debug, Deserialize)]
struct Sidecar {
    id: String,
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    metrics: Vec<MetricDescriptor>,
    #[serde(default)]
    commands: Vec<ExtensionCommand>,
    #[serde(default)]
    config_parameters: Option<Vec<ParameterDefinition>>,
}

pub fn sidecar_path(wasm_path: &Path) -> PathBuf {
    wasm_path.with_extension("json")
}

/// Read and validate the sidecar next to `wasm_path`.
pub fn read_sidecar(wasm_path: &Path) -> Result<ExtensionDescriptor> {
    let path = sidecar_path(wasm_path);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExtensionError::SidecarMissing(path))
        }
        Err(e) => return Err(e.into()),
    };
    parse_sidecar(&content, wasm_path)
}

pub(crate) fn parse_sidecar(content: &str, wasm_path: &Path) -> Result<ExtensionDescriptor> {
    let sidecar: Sidecar = serde_json::from_str(content).map_err(|e| {
        ExtensionError::SchemaMismatch(format!(
            "{}: {e}",
            sidecar_path(wasm_path).display()
        ))
    })?;

    let version = semver::Version::parse(&sidecar.version).map_err(|e| {
        ExtensionError::SchemaMismatch(format!("version '{}': {e}", sidecar.version))
    })?;

    let descriptor = ExtensionDescriptor {
        metadata: ExtensionMetadata {
            id: sidecar.id,
            name: sidecar.name,
            version,
            description: sidecar.description,
            author: sidecar.author,
            homepage: sidecar.homepage,
            license: sidecar.license,
            file_path: Some(wasm_path.to_path_buf()),
            config_parameters: sidecar.config_parameters,
        },
        metrics: sidecar.metrics,
        commands: sidecar.commands,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::system::MetricDataType;

    const WEATHER: &str = r#"{
        "id": "weather-forecast",
        "name": "Weather Forecast",
        "version": "1.2.0",
        "description": "Simulated weather",
        "license": "MIT",
        "metrics": [
            {"name": "temperature_c", "display_name": "Temperature", "data_type": "float", "unit": "°C", "min": -50, "max": 60}
        ],
        "commands": [
            {
                "name": "query_weather",
                "display_name": "Query Weather",
                "parameters": [{"name": "city", "param_type": "string", "required": true}],
                "samples": [{"city": "Beijing"}],
                "llm_hints": "Current conditions for a city"
            }
        ]
    }"#;

    #[test]
    fn test_parse_sidecar() {
        let path = Path::new("/ext/weather.wasm");
        let descriptor = parse_sidecar(WEATHER, path).unwrap();
        assert_eq!(descriptor.metadata.id, "weather-forecast");
        assert_eq!(descriptor.metadata.version, semver::Version::new(1, 2, 0));
        assert_eq!(descriptor.metadata.file_path.as_deref(), Some(path));
        assert_eq!(descriptor.metrics[0].data_type, MetricDataType::Float);
        assert_eq!(descriptor.commands[0].parameters[0].name, "city");
    }

    #[test]
    fn test_invalid_data_type_rejected() {
        let content = WEATHER.replace("\"data_type\": \"float\"", "\"data_type\": \"binary\"");
        let err = parse_sidecar(&content, Path::new("weather.wasm")).unwrap_err();
        assert!(matches!(err, ExtensionError::SchemaMismatch(_)));
    }

    #[test]
    fn test_invalid_version_rejected() {
        let content = WEATHER.replace("1.2.0", "one");
        let err = parse_sidecar(&content, Path::new("weather.wasm")).unwrap_err();
        assert!(err.to_string().contains("version 'one'"));
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let wasm = dir.path().join("lonely.wasm");
        std::fs::write(&wasm, b"\0asm").unwrap();
        match read_sidecar(&wasm) {
            Err(ExtensionError::SidecarMissing(path)) => {
                assert_eq!(path, dir.path().join("lonely.json"))
            }
            other => panic!("expected SidecarMissing, got {other:?}"),
        }
    }
}
