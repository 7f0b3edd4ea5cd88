use super::{parse_env_list, ImageSource, ResolvedImage};
use async_trait::async_trait;
use bollard::image::CreateImageOptions;
use bollard::models::ImageInspect;
use bollard::Docker;
use futures_util::TryStreamExt;
use slipway_core::descriptor::ImageRef;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use tracing::{debug, info};

/// Resolves base images through the local Docker daemon, pulling on a miss
#[derive(Debug, Clone)]
pub struct DockerImageSource {
    pull: bool,
}

impl DockerImageSource {
    pub fn new(pull: bool) -> Self {
        Self { pull }
    }

    fn connect(reference: &ImageRef) -> Result<Docker, BuildError> {
        Docker::connect_with_local_defaults().map_err(|e| {
            BuildError::image_unavailable(
                reference.to_string(),
                format!("Failed to connect to Docker: {}", e),
            )
        })
    }

    async fn pull(docker: &Docker, reference: &ImageRef) -> Result<(), BuildError> {
        info!(image = %reference, "Pulling base image");
        // The tag parameter also accepts a digest.
        let options = CreateImageOptions {
            from_image: reference.name().to_string(),
            tag: match reference.digest() {
                Some(digest) => digest.to_string(),
                None => reference.tag_or_latest().to_string(),
            },
            ..Default::default()
        };

        docker
            .create_image(Some(options), None, None)
            .try_for_each(|progress| {
                if let Some(status) = progress.status {
                    debug!(image = %reference, "{}", status);
                }
                futures_util::future::ok(())
            })
            .await
            .map_err(|e| BuildError::image_unavailable(reference.to_string(), e))
    }

    fn inspect_target(reference: &ImageRef) -> String {
        match reference.digest() {
            Some(digest) => format!("{}@{}", reference.name(), digest),
            None => format!("{}:{}", reference.name(), reference.tag_or_latest()),
        }
    }
}

/// Prefer the registry digest so resolution is stable across hosts;
/// fall back to the local image id.
fn content_digest(reference: &ImageRef, inspect: &ImageInspect) -> Result<Digest, BuildError> {
    let repo_digest = inspect.repo_digests.as_ref().and_then(|digests| {
        digests
            .iter()
            .filter_map(|d| d.split_once('@'))
            .find(|(name, _)| *name == reference.name() || name.ends_with(reference.name()))
            .or_else(|| digests.iter().filter_map(|d| d.split_once('@')).next())
            .and_then(|(_, digest)| Digest::parse(digest).ok())
    });

    repo_digest
        .or_else(|| inspect.id.as_deref().and_then(|id| Digest::parse(id).ok()))
        .ok_or_else(|| {
            BuildError::image_unavailable(reference.to_string(), "image has no content digest")
        })
}

fn to_resolved(reference: &ImageRef, inspect: &ImageInspect) -> Result<ResolvedImage, BuildError> {
    let digest = content_digest(reference, inspect)?;
    let mut resolved = ResolvedImage::new(reference, digest);

    if let Some(config) = &inspect.config {
        if let Some(env) = &config.env {
            resolved.env.extend(parse_env_list(env));
        }
        resolved.workdir = config.working_dir.clone().filter(|w| !w.is_empty());
    }

    Ok(resolved)
}

#[async_trait]
impl ImageSource for DockerImageSource {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage, BuildError> {
        let docker = Self::connect(reference)?;
        let target = Self::inspect_target(reference);

        let inspect = match docker.inspect_image(&target).await {
            Ok(inspect) => inspect,
            Err(e) if self.pull => {
                debug!(image = %target, "Image not present locally: {}", e);
                Self::pull(&docker, reference).await?;
                docker
                    .inspect_image(&target)
                    .await
                    .map_err(|e| BuildError::image_unavailable(reference.to_string(), e))?
            }
            Err(e) => return Err(BuildError::image_unavailable(reference.to_string(), e)),
        };

        let resolved = to_resolved(reference, &inspect)?;
        info!(image = %reference, digest = %resolved.digest, "Resolved base image");
        Ok(resolved)
    }
}
