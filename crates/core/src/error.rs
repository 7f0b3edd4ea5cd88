use crate::image::StepKind;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal build-time failures. None of them are retried; the build stops at
/// the step that raised them and no image record is written.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Base image {reference} is unavailable: {reason}")]
    ImageUnavailable { reference: String, reason: String },

    #[error("Failed to stage build context {}: {reason}", path.display())]
    StagingFailure { path: PathBuf, reason: String },

    #[error("Dependency installation from {manifest} failed: {reason}")]
    DependencyInstallFailure { manifest: String, reason: String },

    #[error("Build cancelled before {step} could commit")]
    Cancelled { step: StepKind },

    #[error("Invalid build descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Layer store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl BuildError {
    pub fn image_unavailable(reference: impl Into<String>, reason: impl ToString) -> Self {
        BuildError::ImageUnavailable {
            reference: reference.into(),
            reason: reason.to_string(),
        }
    }

    pub fn staging(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BuildError::StagingFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn install(manifest: impl Into<String>, reason: impl ToString) -> Self {
        BuildError::DependencyInstallFailure {
            manifest: manifest.into(),
            reason: reason.to_string(),
        }
    }

    /// The pipeline step a failure belongs to, when it belongs to one
    pub fn step(&self) -> Option<StepKind> {
        match self {
            BuildError::ImageUnavailable { .. } => Some(StepKind::BaseImage),
            BuildError::StagingFailure { .. } => Some(StepKind::Stage),
            BuildError::DependencyInstallFailure { .. } => Some(StepKind::Dependencies),
            BuildError::Cancelled { step } => Some(*step),
            BuildError::InvalidDescriptor(_) | BuildError::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = BuildError::image_unavailable("python:3.11-slim", "no such image");
        assert_eq!(
            err.to_string(),
            "Base image python:3.11-slim is unavailable: no such image"
        );

        let err = BuildError::staging("/ctx", "permission denied");
        assert_eq!(
            err.to_string(),
            "Failed to stage build context /ctx: permission denied"
        );

        let err = BuildError::install("requirements.txt", "manifest not found");
        assert!(err.to_string().contains("requirements.txt"));
        assert!(err.to_string().contains("manifest not found"));
    }

    #[test]
    fn test_step_mapping() {
        assert_eq!(
            BuildError::image_unavailable("x", "y").step(),
            Some(StepKind::BaseImage)
        );
        assert_eq!(BuildError::staging("/", "y").step(), Some(StepKind::Stage));
        assert_eq!(
            BuildError::install("m", "y").step(),
            Some(StepKind::Dependencies)
        );
        assert_eq!(
            BuildError::Cancelled {
                step: StepKind::Entrypoint
            }
            .step(),
            Some(StepKind::Entrypoint)
        );
        assert_eq!(BuildError::InvalidDescriptor("x".into()).step(), None);
    }

    #[test]
    fn test_store_error_from_anyhow() {
        let err: BuildError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, BuildError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
