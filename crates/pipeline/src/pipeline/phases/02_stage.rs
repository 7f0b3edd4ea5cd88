use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use crate::plan::StageSource;
use crate::staging::{ContextTree, StagedContext};
use crate::store::DiffBuilder;
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;
use tracing::info;

/// Copies the build context (or just the manifest) into the working directory
pub struct StagePhase {
    pub workdir: String,
    pub source: StageSource,
}

impl StagePhase {
    fn scan(&self, context: &BuildContext) -> Result<ContextTree, BuildError> {
        let dir = &context.context_dir;
        let tree = match &self.source {
            StageSource::Context => ContextTree::scan(dir),
            StageSource::Manifest(manifest) => {
                if !dir.is_dir() {
                    return Err(BuildError::staging(dir, "build context is not a directory"));
                }
                ContextTree::single_file(dir, manifest)
            }
        };
        tree.map_err(|e| BuildError::staging(dir, format!("{:#}", e)))
    }
}

#[async_trait]
impl BuildPhase for StagePhase {
    fn name(&self) -> &'static str {
        "StagePhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::Stage
    }

    fn describe(&self) -> String {
        match &self.source {
            StageSource::Context => format!("COPY . {}", self.workdir),
            StageSource::Manifest(manifest) => format!(
                "COPY {} {}/{}",
                manifest,
                self.workdir.trim_end_matches('/'),
                manifest
            ),
        }
    }

    async fn prepare(&self, context: &mut BuildContext) -> Result<(), BuildError> {
        let tree = self.scan(context)?;
        let digest = tree
            .digest()
            .map_err(|e| BuildError::staging(&context.context_dir, format!("{:#}", e)))?;
        context.staged = Some(StagedContext { tree, digest });
        Ok(())
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let staged = context.staged.as_ref().ok_or_else(|| {
            BuildError::staging(&context.context_dir, "build context was not scanned")
        })?;

        let mut key = context.key_builder(self.kind());
        key.update(&self.workdir);
        match &self.source {
            StageSource::Context => key.update(b"context"),
            StageSource::Manifest(manifest) => key.update(b"manifest").update(manifest),
        };
        key.update_digest(&staged.digest);
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        let StagedContext { tree, digest } = context.staged.take().ok_or_else(|| {
            BuildError::staging(&context.context_dir, "build context was not scanned")
        })?;

        let mut diff = DiffBuilder::create(&context.store.ingest_dir())?;
        diff.append_dir_all(&self.workdir)?;
        let written = tree
            .write_into(&mut diff, &self.workdir)
            .map_err(|e| BuildError::staging(&context.context_dir, format!("{:#}", e)))?;
        if written != digest {
            return Err(BuildError::staging(
                &context.context_dir,
                "build context changed while it was being staged",
            ));
        }
        let diff = diff.finish()?;

        info!(
            workdir = %self.workdir,
            entries = tree.len(),
            size_bytes = diff.size,
            "Staged build context"
        );

        let mut config = context.config.clone();
        config.workdir = self.workdir.clone();
        Ok(StepOutput {
            config,
            diff: Some(diff),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestBed;
    use std::fs;

    fn stage_all() -> StagePhase {
        StagePhase {
            workdir: "/app".to_string(),
            source: StageSource::Context,
        }
    }

    async fn key(phase: &StagePhase, context: &mut BuildContext) -> Digest {
        phase.prepare(context).await.unwrap();
        phase.cache_key(context).await.unwrap()
    }

    #[tokio::test]
    async fn test_key_tracks_context_content() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = stage_all();

        let before = key(&phase, &mut context).await;
        assert_eq!(before, key(&phase, &mut context).await);

        fs::write(bed.context_dir().join("app.py"), "print('v2')\n").unwrap();
        assert_ne!(before, key(&phase, &mut context).await);
    }

    #[tokio::test]
    async fn test_manifest_stage_ignores_source_edits() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = StagePhase {
            workdir: "/app".to_string(),
            source: StageSource::Manifest("requirements.txt".to_string()),
        };

        let before = key(&phase, &mut context).await;
        fs::write(bed.context_dir().join("app.py"), "print('v2')\n").unwrap();
        assert_eq!(before, key(&phase, &mut context).await);

        fs::write(bed.context_dir().join("requirements.txt"), "flask==3.0.3\n").unwrap();
        assert_ne!(before, key(&phase, &mut context).await);
    }

    #[tokio::test]
    async fn test_missing_context_is_staging_failure() {
        let bed = TestBed::new();
        fs::remove_dir_all(bed.context_dir()).unwrap();
        let mut context = bed.context();
        let err = stage_all().prepare(&mut context).await.unwrap_err();
        assert!(matches!(err, BuildError::StagingFailure { .. }));
    }

    #[tokio::test]
    async fn test_key_requires_scan() {
        let bed = TestBed::new();
        let context = bed.context();
        let err = stage_all().cache_key(&context).await.unwrap_err();
        assert!(matches!(err, BuildError::StagingFailure { .. }));
    }

    #[tokio::test]
    async fn test_execute_sets_workdir_and_diff() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = stage_all();
        phase.prepare(&mut context).await.unwrap();
        let output = phase.execute(&mut context).await.unwrap();
        assert_eq!(output.config.workdir, "/app");
        assert!(output.diff.unwrap().entries >= 3);
        assert!(context.staged.is_none());
    }

    #[tokio::test]
    async fn test_edit_after_keying_is_not_committed_under_old_key() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = stage_all();
        key(&phase, &mut context).await;

        fs::write(bed.context_dir().join("app.py"), "print('edited')\n").unwrap();
        let err = phase.execute(&mut context).await.unwrap_err();
        assert!(matches!(err, BuildError::StagingFailure { .. }));
    }
}
