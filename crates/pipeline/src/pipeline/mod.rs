pub mod context;
pub mod orchestrator;
pub mod phase_trait;
pub mod phases;

pub use context::{BuildContext, StepOutput};
pub use orchestrator::BuildEngine;
pub use phase_trait::BuildPhase;
