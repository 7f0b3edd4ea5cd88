//! Declarative build descriptor
//!
//! A [`BuildDescriptor`] is the complete input of one image build: the base
//! image, where the context lands, which manifest to install from, and the
//! runtime contract (environment, ports, entrypoint) attached to the image.

pub mod dockerfile;
mod image_ref;
mod port;

pub use image_ref::ImageRef;
pub use port::{ExposedPort, Protocol};

use anyhow::{Context, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path};
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_WORKDIR: &str = "/app";
const DEFAULT_MANIFEST: &str = "requirements.txt";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidImage { reference: String, reason: String },

    #[error("Invalid port '{value}': {reason}")]
    InvalidPort { value: String, reason: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Dockerfile line {line}: {reason}")]
    Dockerfile { line: usize, reason: String },
}

impl From<DescriptorError> for crate::error::BuildError {
    fn from(err: DescriptorError) -> Self {
        crate::error::BuildError::InvalidDescriptor(err.to_string())
    }
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_null_default_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_version))
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildDescriptor {
    #[serde(
        default = "default_version",
        deserialize_with = "deserialize_null_default_version"
    )]
    pub version: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub metadata: DescriptorMetadata,
    pub base: ImageRef,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub stage: StageSpec,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub dependencies: DependencySpec,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub runtime: RuntimeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
pub struct DescriptorMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// Order in which the context and the manifest enter the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StagingStrategy {
    /// Copy the whole context, then install
    #[default]
    SingleCopy,
    /// Copy the manifest, install, then copy the whole context
    ManifestFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StageSpec {
    pub workdir: String,
    pub strategy: StagingStrategy,
}

impl Default for StageSpec {
    fn default() -> Self {
        Self {
            workdir: DEFAULT_WORKDIR.to_string(),
            strategy: StagingStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DependencySpec {
    /// Manifest path relative to the staged working directory
    pub manifest: String,
    /// Extra arguments passed to the installer
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub install_args: Vec<String>,
}

impl Default for DependencySpec {
    fn default() -> Self {
        Self {
            manifest: DEFAULT_MANIFEST.to_string(),
            install_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
pub struct RuntimeSpec {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub env: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ports: Vec<ExposedPort>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub entrypoint: Vec<String>,
}

fn env_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

impl fmt::Display for BuildDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_yaml() {
            Ok(yaml) => write!(f, "{}", yaml),
            Err(e) => write!(f, "Error formatting BuildDescriptor: {}", e),
        }
    }
}

impl BuildDescriptor {
    /// Descriptor for a small Python web service: slim interpreter image,
    /// source in `/app`, pip requirements, unbuffered output, port 5000.
    pub fn python_service() -> Self {
        Self {
            version: default_version(),
            metadata: DescriptorMetadata::default(),
            base: ImageRef::parse("python:3.11-slim").expect("valid image reference"),
            stage: StageSpec::default(),
            dependencies: DependencySpec::default(),
            runtime: RuntimeSpec {
                env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
                ports: vec![ExposedPort::tcp(5000)],
                entrypoint: vec!["python".to_string(), "app.py".to_string()],
            },
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !self.stage.workdir.starts_with('/') {
            return Err(DescriptorError::ValidationFailed(format!(
                "Working directory must be absolute: {}",
                self.stage.workdir
            )));
        }

        let manifest = Path::new(&self.dependencies.manifest);
        if self.dependencies.manifest.trim().is_empty()
            || manifest.is_absolute()
            || manifest
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(DescriptorError::ValidationFailed(format!(
                "Manifest must be a relative path inside the context: {}",
                self.dependencies.manifest
            )));
        }

        if let Some(name) = self
            .runtime
            .env
            .keys()
            .find(|name| !env_name_regex().is_match(name))
        {
            return Err(DescriptorError::ValidationFailed(format!(
                "Invalid environment variable name: {}",
                name
            )));
        }

        let mut seen = HashSet::new();
        for port in &self.runtime.ports {
            if !seen.insert(*port) {
                return Err(DescriptorError::ValidationFailed(format!(
                    "Port {} is declared more than once",
                    port
                )));
            }
        }

        if self.runtime.entrypoint.is_empty() || self.runtime.entrypoint[0].is_empty() {
            return Err(DescriptorError::ValidationFailed(
                "Entrypoint must name a program".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse build descriptor YAML")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse build descriptor TOML")
    }

    /// Load a descriptor, picking the format from the file name:
    /// `*.toml`, `Dockerfile`/`*.dockerfile`, anything else as YAML (or JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor {}", path.display()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let descriptor = if file_name.ends_with(".toml") {
            Self::from_toml(&content)?
        } else if file_name == "dockerfile" || file_name.ends_with(".dockerfile") {
            dockerfile::parse(&content)?
        } else {
            Self::from_yaml(&content)?
        };

        tracing::debug!(path = %path.display(), base = %descriptor.base, "Loaded build descriptor");
        Ok(descriptor)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize BuildDescriptor to YAML")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize BuildDescriptor to JSON")
    }

    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(BuildDescriptor);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_python_service_is_valid() {
        let descriptor = BuildDescriptor::python_service();
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.base.to_string(), "python:3.11-slim");
        assert_eq!(descriptor.stage.workdir, "/app");
        assert_eq!(descriptor.dependencies.manifest, "requirements.txt");
        assert_eq!(descriptor.runtime.env.len(), 1);
        assert_eq!(
            descriptor.runtime.env.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );
        assert_eq!(descriptor.runtime.ports, vec![ExposedPort::tcp(5000)]);
        assert_eq!(descriptor.runtime.entrypoint, vec!["python", "app.py"]);
    }

    #[test]
    fn test_to_yaml() {
        let yaml = BuildDescriptor::python_service().to_yaml().unwrap();
        assert!(yaml.contains("version:"));
        assert!(yaml.contains("base: python:3.11-slim"));
        assert!(yaml.contains("workdir: /app"));
        assert!(yaml.contains("strategy: single-copy"));
        assert!(yaml.contains("PYTHONUNBUFFERED"));
        assert!(yaml.contains("5000/tcp"));
    }

    #[test]
    fn test_yaml_roundtrip_preserves_descriptor() {
        let descriptor = BuildDescriptor::python_service();
        let back = BuildDescriptor::from_yaml(&descriptor.to_yaml().unwrap()).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn test_deserialize_minimal() {
        let descriptor = BuildDescriptor::from_yaml(
            r#"
base: python:3.12-slim
runtime:
  entrypoint: ["python", "main.py"]
"#,
        )
        .unwrap();

        assert_eq!(descriptor.version, "1.0");
        assert_eq!(descriptor.stage, StageSpec::default());
        assert_eq!(descriptor.dependencies.manifest, "requirements.txt");
        assert!(descriptor.runtime.env.is_empty());
        assert!(descriptor.runtime.ports.is_empty());
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_null_values() {
        let descriptor: BuildDescriptor = serde_json::from_str(
            r#"{
                "version": null,
                "metadata": null,
                "base": "python:3.11-slim",
                "stage": null,
                "runtime": { "env": null, "ports": null, "entrypoint": ["python"] }
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.version, "1.0");
        assert_eq!(descriptor.stage.workdir, "/app");
        assert!(descriptor.runtime.env.is_empty());
    }

    #[test]
    fn test_missing_base_is_an_error() {
        assert!(BuildDescriptor::from_yaml("runtime: {}").is_err());
    }

    #[test]
    fn test_from_toml() {
        let descriptor = BuildDescriptor::from_toml(
            r#"
base = "python:3.11-slim"

[stage]
strategy = "manifest-first"

[runtime]
ports = ["5000/tcp"]
entrypoint = ["python", "app.py"]

[runtime.env]
PYTHONUNBUFFERED = "1"
"#,
        )
        .unwrap();

        assert_eq!(descriptor.stage.strategy, StagingStrategy::ManifestFirst);
        assert_eq!(descriptor.runtime.ports, vec![ExposedPort::tcp(5000)]);
    }

    #[test]
    fn test_validate_rejects_relative_workdir() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.stage.workdir = "app".to_string();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_escaping_manifest() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.dependencies.manifest = "../requirements.txt".to_string();
        assert!(descriptor.validate().is_err());

        descriptor.dependencies.manifest = "/requirements.txt".to_string();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_env_name() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor
            .runtime
            .env
            .insert("1BAD".to_string(), "x".to_string());
        let err = descriptor.validate().unwrap_err();
        assert!(err.to_string().contains("1BAD"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.runtime.ports.push(ExposedPort::tcp(5000));
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_validate_allows_same_port_different_protocol() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.runtime.ports.push("5000/udp".parse().unwrap());
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_entrypoint() {
        let mut descriptor = BuildDescriptor::python_service();
        descriptor.runtime.entrypoint.clear();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = TempDir::new().unwrap();
        let yaml_path = dir.path().join("slipway.yaml");
        fs::write(&yaml_path, BuildDescriptor::python_service().to_yaml().unwrap()).unwrap();
        assert_eq!(
            BuildDescriptor::load(&yaml_path).unwrap(),
            BuildDescriptor::python_service()
        );

        let dockerfile_path = dir.path().join("Dockerfile");
        fs::write(
            &dockerfile_path,
            dockerfile::render(&BuildDescriptor::python_service()),
        )
        .unwrap();
        assert_eq!(
            BuildDescriptor::load(&dockerfile_path).unwrap(),
            BuildDescriptor::python_service()
        );
    }

    #[test]
    fn test_json_schema_mentions_sections() {
        let schema = BuildDescriptor::json_schema().to_string();
        assert!(schema.contains("\"base\""));
        assert!(schema.contains("\"runtime\""));
        assert!(schema.contains("manifest-first"));
    }
}
