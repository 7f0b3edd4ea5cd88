//! Shared fixtures for unit tests

use crate::cancel::CancellationToken;
use crate::image_source::PinnedImageSource;
use crate::installer::{read_manifest, InstallReport, InstallRequest, PackageInstaller};
use crate::pipeline::context::BuildContext;
use crate::store::LayerStore;
use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const BASE_IMAGE: &str = "python:3.11-slim";

/// Installer that "installs" each requirement as an empty package directory
#[derive(Debug, Default)]
pub struct FakeInstaller;

#[async_trait]
impl PackageInstaller for FakeInstaller {
    fn identity(&self) -> String {
        "fake-pip install".to_string()
    }

    async fn install(&self, request: &InstallRequest) -> Result<InstallReport, BuildError> {
        let requirements = read_manifest(request)?;
        if requirements.is_empty() {
            return Ok(InstallReport {
                requested: 0,
                skipped: true,
                duration: Duration::ZERO,
            });
        }
        for requirement in requirements.packages() {
            let package = request
                .prefix
                .join("lib/site-packages")
                .join(&requirement.name);
            fs::create_dir_all(&package).map_err(|e| BuildError::install(&request.manifest, e))?;
            fs::write(package.join("__init__.py"), "")
                .map_err(|e| BuildError::install(&request.manifest, e))?;
        }
        Ok(InstallReport {
            requested: requirements.len(),
            skipped: false,
            duration: Duration::ZERO,
        })
    }
}

/// A store plus a small Python context, both in temp directories
pub struct TestBed {
    store_dir: TempDir,
    context_dir: TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        let store_dir = TempDir::new().unwrap();
        let context_dir = TempDir::new().unwrap();
        fs::write(
            context_dir.path().join("app.py"),
            "print('hello from slipway')\n",
        )
        .unwrap();
        fs::write(context_dir.path().join("requirements.txt"), "flask\n").unwrap();
        Self {
            store_dir,
            context_dir,
        }
    }

    pub fn context_dir(&self) -> PathBuf {
        self.context_dir.path().to_path_buf()
    }

    pub fn store_dir(&self) -> &Path {
        self.store_dir.path()
    }

    pub fn store(&self) -> Arc<LayerStore> {
        Arc::new(LayerStore::open(self.store_dir.path()).unwrap())
    }

    pub fn context(&self) -> BuildContext {
        self.context_with_pin(BASE_IMAGE, Digest::sha256("python-3.11-slim"))
    }

    pub fn context_with_pin(&self, reference: &str, digest: Digest) -> BuildContext {
        let source = PinnedImageSource::new().with_pin(reference, digest);
        BuildContext::new(
            self.context_dir.path(),
            Arc::new(source),
            Arc::new(FakeInstaller),
            self.store(),
            CancellationToken::new(),
        )
    }
}
