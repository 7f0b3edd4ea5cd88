//! Base image resolution
//!
//! A source turns a mutable `name:tag` reference into an immutable base:
//! a content digest plus the environment and working directory the image
//! ships with.

mod docker;
mod pinned;

pub use docker::DockerImageSource;
pub use pinned::PinnedImageSource;

use anyhow::Result;
use async_trait::async_trait;
use slipway_core::config::{ImageSourceKind, SlipwayConfig};
use slipway_core::descriptor::ImageRef;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `PATH` assumed for images that do not declare one
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Original reference with the digest pinned
    pub reference: ImageRef,
    pub digest: Digest,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl ResolvedImage {
    pub fn new(reference: &ImageRef, digest: Digest) -> Self {
        Self {
            reference: reference.pinned(digest.clone()),
            digest,
            env: BTreeMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]),
            workdir: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage, BuildError>;
}

/// Split `KEY=value` entries as found in image configs
pub(crate) fn parse_env_list(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Source selected by `SLIPWAY_IMAGE_SOURCE`
pub fn from_config(config: &SlipwayConfig) -> Result<Arc<dyn ImageSource>> {
    match config.image_source {
        ImageSourceKind::Docker => Ok(Arc::new(DockerImageSource::new(config.pull))),
        ImageSourceKind::Pinned => {
            let path = config
                .pinned_images
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("SLIPWAY_PINNED_IMAGES is not set"))?;
            Ok(Arc::new(PinnedImageSource::from_file(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_list() {
        let env = parse_env_list(&[
            "PATH=/usr/bin".to_string(),
            "LANG=C.UTF-8".to_string(),
            "EMPTY=".to_string(),
            "garbage".to_string(),
        ]);
        assert_eq!(env.len(), 3);
        assert_eq!(env["LANG"], "C.UTF-8");
        assert_eq!(env["EMPTY"], "");
    }

    #[test]
    fn test_resolved_image_defaults() {
        let reference = ImageRef::parse("python:3.11-slim").unwrap();
        let resolved = ResolvedImage::new(&reference, Digest::sha256("img"));
        assert_eq!(resolved.env["PATH"], DEFAULT_PATH);
        assert_eq!(resolved.reference.digest(), Some(&Digest::sha256("img")));
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut source = MockImageSource::new();
        source
            .expect_resolve()
            .returning(|r| Err(BuildError::image_unavailable(r.to_string(), "offline")));

        let reference = ImageRef::parse("python:3.11-slim").unwrap();
        let err = source.resolve(&reference).await.unwrap_err();
        assert!(matches!(err, BuildError::ImageUnavailable { .. }));
    }
}
