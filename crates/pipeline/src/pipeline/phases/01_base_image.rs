use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use async_trait::async_trait;
use slipway_core::descriptor::ImageRef;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::{ImageConfig, StepKind};
use tracing::debug;

const ROOT_WORKDIR: &str = "/";

pub struct BaseImagePhase {
    pub reference: ImageRef,
}

impl BaseImagePhase {
    fn resolved<'a>(
        &self,
        context: &'a BuildContext,
    ) -> Result<&'a crate::image_source::ResolvedImage, BuildError> {
        context.base.as_ref().ok_or_else(|| {
            BuildError::image_unavailable(self.reference.to_string(), "base image was not resolved")
        })
    }
}

#[async_trait]
impl BuildPhase for BaseImagePhase {
    fn name(&self) -> &'static str {
        "BaseImagePhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::BaseImage
    }

    fn describe(&self) -> String {
        format!("FROM {}", self.reference)
    }

    async fn prepare(&self, context: &mut BuildContext) -> Result<(), BuildError> {
        let resolved = context.image_source.resolve(&self.reference).await?;
        debug!(
            image = %self.reference,
            digest = %resolved.digest,
            source = context.image_source.name(),
            "Base image pinned"
        );
        context.base = Some(resolved);
        Ok(())
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let resolved = self.resolved(context)?;
        let mut key = context.key_builder(self.kind());
        key.update(self.reference.name())
            .update_digest(&resolved.digest);
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        let resolved = self.resolved(context)?;
        Ok(StepOutput::config_only(ImageConfig {
            workdir: resolved
                .workdir
                .clone()
                .unwrap_or_else(|| ROOT_WORKDIR.to_string()),
            ..ImageConfig::default()
        }))
    }
}
