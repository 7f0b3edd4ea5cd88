use crate::descriptor::{ExposedPort, ImageRef};
use crate::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Pipeline step that produced a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    BaseImage,
    Stage,
    Dependencies,
    EnvVars,
    Port,
    Entrypoint,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::BaseImage => "base_image",
            StepKind::Stage => "stage",
            StepKind::Dependencies => "dependencies",
            StepKind::EnvVars => "env_vars",
            StepKind::Port => "port",
            StepKind::Entrypoint => "entrypoint",
        }
    }

    /// Whether the step changes the filesystem or only the image config
    pub fn touches_filesystem(&self) -> bool {
        matches!(self, StepKind::Stage | StepKind::Dependencies)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration accumulated along the layer chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<ExposedPort>,
    pub entrypoint: Vec<String>,
}

impl ImageConfig {
    /// Canonical bytes for hashing; field order is fixed by the struct
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// One committed link of the layer chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Chain identity: covers the parent, the step parameters and the content
    pub digest: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Digest>,
    pub step: StepKind,
    /// Memoisation key: (parent digest, step parameter digest)
    pub cache_key: Digest,
    /// Digest of the uncompressed filesystem diff, if the step has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<Digest>,
    #[serde(default)]
    pub size: u64,
    /// Image config after this step
    pub config: ImageConfig,
    /// Human-readable step description
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub name: String,
    /// Digest of the topmost layer, which pins the whole chain
    pub id: Digest,
    /// Base reference with its resolved digest
    pub base: ImageRef,
    /// Environment inherited from the base image
    #[serde(default)]
    pub base_env: BTreeMap<String, String>,
    pub layers: Vec<LayerRecord>,
    pub config: ImageConfig,
    pub created: DateTime<Utc>,
    pub build_id: String,
}

impl BuiltImage {
    pub fn chain(&self) -> Vec<&Digest> {
        self.layers.iter().map(|l| &l.digest).collect()
    }

    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    pub fn layer(&self, step: StepKind) -> Option<&LayerRecord> {
        self.layers.iter().rev().find(|l| l.step == step)
    }
}
