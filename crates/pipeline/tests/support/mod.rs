#![allow(dead_code)]

use async_trait::async_trait;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use slipway_pipeline::installer::read_manifest;
use slipway_pipeline::{
    BuildEngine, InstallReport, InstallRequest, LayerStore, PackageInstaller, PinnedImageSource,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const BASE_IMAGE: &str = "python:3.11-slim";

/// Writes one package directory per requirement and counts its runs
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    pub runs: AtomicUsize,
}

impl RecordingInstaller {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for RecordingInstaller {
    fn identity(&self) -> String {
        "recording-pip install".to_string()
    }

    async fn install(&self, request: &InstallRequest) -> Result<InstallReport, BuildError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let requirements = read_manifest(request)?;
        for requirement in requirements.packages() {
            let package = request
                .prefix
                .join("lib/python3.11/site-packages")
                .join(&requirement.name);
            fs::create_dir_all(&package).map_err(|e| BuildError::install(&request.manifest, e))?;
            fs::write(package.join("__init__.py"), "")
                .map_err(|e| BuildError::install(&request.manifest, e))?;
        }
        Ok(InstallReport {
            requested: requirements.len(),
            skipped: requirements.is_empty(),
            duration: Duration::ZERO,
        })
    }
}

/// Cache directory, build context and the collaborators a build needs
pub struct Workspace {
    pub cache: TempDir,
    pub context: TempDir,
    pub installer: Arc<RecordingInstaller>,
}

impl Workspace {
    pub fn new() -> Self {
        let context = TempDir::new().unwrap();
        write(context.path(), "app.py", "print('hello from slipway')\n");
        write(context.path(), "requirements.txt", "flask==3.0.0\nrequests>=2.31\n");
        Self {
            cache: TempDir::new().unwrap(),
            context,
            installer: Arc::new(RecordingInstaller::default()),
        }
    }

    pub fn context_dir(&self) -> PathBuf {
        self.context.path().to_path_buf()
    }

    pub fn store(&self) -> Arc<LayerStore> {
        Arc::new(LayerStore::open(self.cache.path()).unwrap())
    }

    pub fn engine(&self) -> BuildEngine {
        self.engine_with_base(Digest::sha256("python:3.11-slim@2024-06"))
    }

    pub fn engine_with_base(&self, digest: Digest) -> BuildEngine {
        let source = PinnedImageSource::new().with_pin(BASE_IMAGE, digest);
        BuildEngine::new(self.store(), Arc::new(source), self.installer.clone())
    }
}

pub fn write(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
