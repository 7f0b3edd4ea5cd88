use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;
use std::collections::BTreeMap;

/// Attaches the descriptor's environment to the image config.
/// Nothing here touches the builder's own process environment.
pub struct EnvVarsPhase {
    pub env: BTreeMap<String, String>,
}

#[async_trait]
impl BuildPhase for EnvVarsPhase {
    fn name(&self) -> &'static str {
        "EnvVarsPhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::EnvVars
    }

    fn describe(&self) -> String {
        let pairs: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("ENV {}", pairs.join(" "))
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let mut key = context.key_builder(self.kind());
        for (name, value) in &self.env {
            key.update(name).update(value);
        }
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        let mut config = context.config.clone();
        config
            .env
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(StepOutput::config_only(config))
    }
}
