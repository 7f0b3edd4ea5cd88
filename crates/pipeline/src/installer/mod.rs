//! Dependency installation

mod pip;
pub mod requirements;

pub use pip::PipInstaller;
pub use requirements::{Requirement, RequirementLine, Requirements, RequirementsError};

use crate::cancel::CancellationToken;
use async_trait::async_trait;
use slipway_core::error::BuildError;
use std::path::PathBuf;
use std::time::Duration;

/// Everything an installer needs for one run, as host paths
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Staged working directory; the installer runs here
    pub workdir: PathBuf,
    /// Manifest path as written in the descriptor, relative to `workdir`
    pub manifest: String,
    /// Directory that receives the installed files; becomes `/usr/local`
    pub prefix: PathBuf,
    pub extra_args: Vec<String>,
    pub cancel: CancellationToken,
}

impl InstallRequest {
    pub fn manifest_path(&self) -> PathBuf {
        self.workdir.join(&self.manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Manifest lines that asked for something to be installed
    pub requested: usize,
    /// True when the manifest listed nothing and the installer never ran
    pub skipped: bool,
    pub duration: Duration,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Stable description of the installer and its fixed flags; part of the
    /// dependency step's cache key
    fn identity(&self) -> String;

    async fn install(&self, request: &InstallRequest) -> Result<InstallReport, BuildError>;
}

/// Read and parse the manifest named by `request`
pub fn read_manifest(request: &InstallRequest) -> Result<Requirements, BuildError> {
    let path = request.manifest_path();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BuildError::install(
                &request.manifest,
                "manifest not found in the staged context",
            ))
        }
        Err(e) => return Err(BuildError::install(&request.manifest, e)),
    };

    Requirements::parse(&content)
        .map_err(|e| BuildError::install(&request.manifest, format!("malformed manifest, {}", e)))
}
