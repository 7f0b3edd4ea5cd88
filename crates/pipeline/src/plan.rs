//! Ordered step list derived from a descriptor

use slipway_core::descriptor::{BuildDescriptor, ExposedPort, ImageRef, StagingStrategy};
use slipway_core::image::StepKind;
use std::collections::BTreeMap;
use std::fmt;

/// What a staging step copies into the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSource {
    /// The whole build context
    Context,
    /// Only the dependency manifest
    Manifest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSpec {
    BaseImage {
        reference: ImageRef,
    },
    Stage {
        workdir: String,
        source: StageSource,
    },
    Dependencies {
        manifest: String,
        install_args: Vec<String>,
    },
    EnvVars {
        env: BTreeMap<String, String>,
    },
    Port {
        ports: Vec<ExposedPort>,
    },
    Entrypoint {
        argv: Vec<String>,
    },
}

impl StepSpec {
    pub fn kind(&self) -> StepKind {
        match self {
            StepSpec::BaseImage { .. } => StepKind::BaseImage,
            StepSpec::Stage { .. } => StepKind::Stage,
            StepSpec::Dependencies { .. } => StepKind::Dependencies,
            StepSpec::EnvVars { .. } => StepKind::EnvVars,
            StepSpec::Port { .. } => StepKind::Port,
            StepSpec::Entrypoint { .. } => StepKind::Entrypoint,
        }
    }

    /// Dockerfile-style one-liner, recorded as the layer's `created_by`
    pub fn describe(&self) -> String {
        match self {
            StepSpec::BaseImage { reference } => format!("FROM {}", reference),
            StepSpec::Stage {
                workdir,
                source: StageSource::Context,
            } => format!("COPY . {}", workdir),
            StepSpec::Stage {
                workdir,
                source: StageSource::Manifest(manifest),
            } => format!("COPY {} {}/{}", manifest, workdir.trim_end_matches('/'), manifest),
            StepSpec::Dependencies {
                manifest,
                install_args,
            } => {
                let mut line = format!("RUN pip install --no-cache-dir -r {}", manifest);
                for arg in install_args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
            StepSpec::EnvVars { env } => {
                let pairs: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("ENV {}", pairs.join(" "))
            }
            StepSpec::Port { ports } => {
                let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                format!("EXPOSE {}", ports.join(" "))
            }
            StepSpec::Entrypoint { argv } => format!("CMD {:?}", argv),
        }
    }
}

impl fmt::Display for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub steps: Vec<StepSpec>,
}

impl BuildPlan {
    pub fn from_descriptor(descriptor: &BuildDescriptor) -> Self {
        let workdir = descriptor.stage.workdir.clone();
        let manifest = descriptor.dependencies.manifest.clone();

        let mut steps = vec![StepSpec::BaseImage {
            reference: descriptor.base.clone(),
        }];

        let install = StepSpec::Dependencies {
            manifest: manifest.clone(),
            install_args: descriptor.dependencies.install_args.clone(),
        };
        let stage_context = StepSpec::Stage {
            workdir: workdir.clone(),
            source: StageSource::Context,
        };

        match descriptor.stage.strategy {
            StagingStrategy::SingleCopy => {
                steps.push(stage_context);
                steps.push(install);
            }
            StagingStrategy::ManifestFirst => {
                steps.push(StepSpec::Stage {
                    workdir,
                    source: StageSource::Manifest(manifest),
                });
                steps.push(install);
                steps.push(stage_context);
            }
        }

        steps.push(StepSpec::EnvVars {
            env: descriptor.runtime.env.clone(),
        });
        steps.push(StepSpec::Port {
            ports: descriptor.runtime.ports.clone(),
        });
        steps.push(StepSpec::Entrypoint {
            argv: descriptor.runtime.entrypoint.clone(),
        });

        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(StepSpec::kind).collect()
    }
}
