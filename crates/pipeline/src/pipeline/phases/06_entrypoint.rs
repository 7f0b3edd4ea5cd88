use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;

/// Fixes the exec-form argument vector of the container's first process
pub struct EntrypointPhase {
    pub argv: Vec<String>,
}

#[async_trait]
impl BuildPhase for EntrypointPhase {
    fn name(&self) -> &'static str {
        "EntrypointPhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::Entrypoint
    }

    fn describe(&self) -> String {
        format!("CMD {:?}", self.argv)
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let mut key = context.key_builder(self.kind());
        key.update((self.argv.len() as u64).to_le_bytes());
        for arg in &self.argv {
            key.update(arg);
        }
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        if self.argv.is_empty() {
            return Err(BuildError::InvalidDescriptor(
                "entrypoint must name a program".to_string(),
            ));
        }
        let mut config = context.config.clone();
        config.entrypoint = self.argv.clone();
        Ok(StepOutput::config_only(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestBed;

    #[tokio::test]
    async fn test_sets_argv_verbatim() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = EntrypointPhase {
            argv: vec!["python".to_string(), "app.py".to_string(), "$HOME".to_string()],
        };
        let output = phase.execute(&mut context).await.unwrap();
        assert_eq!(output.config.entrypoint, vec!["python", "app.py", "$HOME"]);
        assert_eq!(phase.describe(), "CMD [\"python\", \"app.py\", \"$HOME\"]");
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let bed = TestBed::new();
        let mut context = bed.context();
        let phase = EntrypointPhase { argv: Vec::new() };
        assert!(phase.execute(&mut context).await.is_err());
    }
}
