use crate::cancel::CancellationToken;
use crate::image_source::{ImageSource, ResolvedImage};
use crate::installer::PackageInstaller;
use crate::staging::StagedContext;
use crate::store::{LayerStore, PendingDiff};
use anyhow::Context;
use slipway_core::digest::{Digest, DigestBuilder};
use slipway_core::error::BuildError;
use slipway_core::image::{ImageConfig, LayerRecord, StepKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State threaded through the phases of one build
pub struct BuildContext {
    pub context_dir: PathBuf,
    pub image_source: Arc<dyn ImageSource>,
    pub installer: Arc<dyn PackageInstaller>,
    pub store: Arc<LayerStore>,
    pub cancel: CancellationToken,
    pub base: Option<ResolvedImage>,
    /// Config as left by the last committed layer
    pub config: ImageConfig,
    pub layers: Vec<LayerRecord>,
    /// Context snapshot taken by the staging step currently running
    pub staged: Option<StagedContext>,
}

/// Result of executing a phase, not yet committed
#[derive(Debug)]
pub struct StepOutput {
    pub config: ImageConfig,
    pub diff: Option<PendingDiff>,
}

impl StepOutput {
    pub fn config_only(config: ImageConfig) -> Self {
        Self { config, diff: None }
    }
}

impl BuildContext {
    pub fn new(
        context_dir: &Path,
        image_source: Arc<dyn ImageSource>,
        installer: Arc<dyn PackageInstaller>,
        store: Arc<LayerStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context_dir: context_dir.to_path_buf(),
            image_source,
            installer,
            store,
            cancel,
            base: None,
            config: ImageConfig::default(),
            layers: Vec::new(),
            staged: None,
        }
    }

    pub fn parent(&self) -> Option<&Digest> {
        self.layers.last().map(|l| &l.digest)
    }

    /// Start a cache key for `kind` chained onto the current parent layer
    pub fn key_builder(&self, kind: StepKind) -> DigestBuilder {
        let mut builder = DigestBuilder::new("slipway.step.v1");
        match self.parent() {
            Some(parent) => builder.update_digest(parent),
            None => builder.update(b""),
        };
        builder.update(kind.as_str());
        builder
    }

    /// Record a committed or replayed layer as the new head of the chain
    pub fn push_layer(&mut self, record: LayerRecord) {
        self.config = record.config.clone();
        self.layers.push(record);
    }

    /// Extract every committed layer into `dest`
    pub fn materialise(&self, dest: &Path) -> Result<(), BuildError> {
        self.store
            .export_rootfs(&self.layers, dest)
            .with_context(|| format!("Failed to materialise image into {}", dest.display()))
            .map_err(BuildError::Store)
    }
}
