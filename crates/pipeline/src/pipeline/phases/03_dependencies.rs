use crate::installer::InstallRequest;
use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use crate::store::DiffBuilder;
use anyhow::Context;
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Installed files land here inside the image
pub const INSTALL_PREFIX: &str = "/usr/local";

/// Installs the manifest's dependencies on top of the staged tree.
///
/// The manifest contents are not part of the key: they already reach it
/// through the parent digest of the staging layer.
pub struct DependenciesPhase {
    pub manifest: String,
    pub install_args: Vec<String>,
}

fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[async_trait]
impl BuildPhase for DependenciesPhase {
    fn name(&self) -> &'static str {
        "DependenciesPhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::Dependencies
    }

    fn describe(&self) -> String {
        let mut line = format!("RUN pip install --no-cache-dir -r {}", self.manifest);
        for arg in &self.install_args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let mut key = context.key_builder(self.kind());
        key.update(&self.manifest)
            .update(context.installer.identity());
        for arg in &self.install_args {
            key.update(arg);
        }
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        let scratch = tempfile::Builder::new()
            .prefix("install-")
            .tempdir_in(context.store.ingest_dir())
            .context("Failed to create install scratch directory")?;
        let rootfs = scratch.path().join("rootfs");
        let prefix = scratch.path().join("prefix");
        fs::create_dir_all(&prefix).context("Failed to create install prefix")?;

        context.materialise(&rootfs)?;
        let workdir = rootfs.join(context.config.workdir.trim_start_matches('/'));
        fs::create_dir_all(&workdir)
            .with_context(|| format!("Failed to create {}", workdir.display()))?;

        let request = InstallRequest {
            workdir,
            manifest: self.manifest.clone(),
            prefix: prefix.clone(),
            extra_args: self.install_args.clone(),
            cancel: context.cancel.clone(),
        };

        debug!(
            manifest = %self.manifest,
            installer = %context.installer.identity(),
            "Installing dependencies"
        );
        let report = context.installer.install(&request).await?;

        let config = context.config.clone();
        if report.skipped || dir_is_empty(&prefix) {
            info!(manifest = %self.manifest, "No dependencies installed");
            return Ok(StepOutput::config_only(config));
        }

        let mut diff = DiffBuilder::create(&context.store.ingest_dir())?;
        diff.append_dir_all(INSTALL_PREFIX)?;
        diff.append_tree(&prefix, INSTALL_PREFIX)?;
        let diff = diff.finish()?;

        info!(
            manifest = %self.manifest,
            requested = report.requested,
            size_bytes = diff.size,
            duration_ms = report.duration.as_millis(),
            "Dependency layer ready"
        );

        Ok(StepOutput {
            config,
            diff: Some(diff),
        })
    }
}
