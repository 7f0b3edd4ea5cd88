use super::context::{BuildContext, StepOutput};
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;

/// One step of the layer pipeline: a function from the predecessor snapshot
/// and the step's parameters to a new snapshot, memoised on `cache_key`.
#[async_trait]
pub trait BuildPhase: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StepKind;

    /// Dockerfile-style description recorded on the layer
    fn describe(&self) -> String;

    /// Work that must happen before the cache key can be computed
    async fn prepare(&self, _context: &mut BuildContext) -> Result<(), BuildError> {
        Ok(())
    }

    /// Digest of (parent layer, step parameters)
    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError>;

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError>;
}
