pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod image;
pub mod progress;

pub use config::{ConfigError, ImageSourceKind, SlipwayConfig};
pub use descriptor::{
    BuildDescriptor, DependencySpec, DescriptorError, DescriptorMetadata, ExposedPort, ImageRef,
    Protocol, RuntimeSpec, StageSpec, StagingStrategy,
};
pub use digest::{Digest, DigestBuilder};
pub use error::BuildError;
pub use image::{BuiltImage, ImageConfig, LayerRecord, StepKind};
pub use progress::{LoggingHandler, NoOpHandler, ProgressEvent, ProgressHandler};
