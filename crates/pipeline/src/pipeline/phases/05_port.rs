use crate::pipeline::context::{BuildContext, StepOutput};
use crate::pipeline::phase_trait::BuildPhase;
use async_trait::async_trait;
use slipway_core::descriptor::ExposedPort;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_core::image::StepKind;

/// Records exposed ports. Advisory metadata: no socket is opened and no
/// binding is published, at build time or at launch.
pub struct PortPhase {
    pub ports: Vec<ExposedPort>,
}

#[async_trait]
impl BuildPhase for PortPhase {
    fn name(&self) -> &'static str {
        "PortPhase"
    }

    fn kind(&self) -> StepKind {
        StepKind::Port
    }

    fn describe(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(ExposedPort::to_string).collect();
        format!("EXPOSE {}", ports.join(" "))
    }

    async fn cache_key(&self, context: &BuildContext) -> Result<Digest, BuildError> {
        let mut key = context.key_builder(self.kind());
        let mut ports = self.ports.clone();
        ports.sort();
        for port in ports {
            key.update(port.to_string());
        }
        Ok(key.finish())
    }

    async fn execute(&self, context: &mut BuildContext) -> Result<StepOutput, BuildError> {
        let mut config = context.config.clone();
        config.exposed_ports.extend(self.ports.iter().copied());
        Ok(StepOutput::config_only(config))
    }
}
