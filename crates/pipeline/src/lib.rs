pub mod cancel;
pub mod image_source;
pub mod installer;
pub mod pipeline;
pub mod plan;
pub mod runtime;
pub mod staging;
pub mod store;

#[cfg(test)]
mod test_support;

pub use cancel::CancellationToken;
pub use image_source::{DockerImageSource, ImageSource, PinnedImageSource, ResolvedImage};
pub use installer::{InstallReport, InstallRequest, PackageInstaller, PipInstaller};
pub use pipeline::orchestrator::BuildEngine;
pub use plan::{BuildPlan, StepSpec};
pub use runtime::{launch, ExitOutcome, LaunchSpec, RunOverrides};
pub use store::{LayerStore, PruneReport};
