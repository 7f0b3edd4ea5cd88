// Build phases, one per pipeline step
//
// Each phase derives its cache key from the parent layer and its own
// parameters, and produces either a filesystem diff or a config change.

#[path = "01_base_image.rs"]
pub mod base_image;
#[path = "03_dependencies.rs"]
pub mod dependencies;
#[path = "06_entrypoint.rs"]
pub mod entrypoint;
#[path = "04_env_vars.rs"]
pub mod env_vars;
#[path = "05_port.rs"]
pub mod port;
#[path = "02_stage.rs"]
pub mod stage;

use super::phase_trait::BuildPhase;
use crate::plan::StepSpec;

pub use base_image::BaseImagePhase;
pub use dependencies::DependenciesPhase;
pub use entrypoint::EntrypointPhase;
pub use env_vars::EnvVarsPhase;
pub use port::PortPhase;
pub use stage::StagePhase;

pub fn for_step(step: &StepSpec) -> Box<dyn BuildPhase> {
    match step.clone() {
        StepSpec::BaseImage { reference } => Box::new(BaseImagePhase { reference }),
        StepSpec::Stage { workdir, source } => Box::new(StagePhase { workdir, source }),
        StepSpec::Dependencies {
            manifest,
            install_args,
        } => Box::new(DependenciesPhase {
            manifest,
            install_args,
        }),
        StepSpec::EnvVars { env } => Box::new(EnvVarsPhase { env }),
        StepSpec::Port { ports } => Box::new(PortPhase { ports }),
        StepSpec::Entrypoint { argv } => Box::new(EntrypointPhase { argv }),
    }
}
