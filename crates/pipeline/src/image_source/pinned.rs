use super::{ImageSource, ResolvedImage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use slipway_core::descriptor::ImageRef;
use slipway_core::digest::Digest;
use slipway_core::error::BuildError;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// One entry of a pin file: either a bare digest or a digest with config
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PinEntry {
    Digest(Digest),
    Full {
        digest: Digest,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        workdir: Option<String>,
    },
}

/// Offline source backed by a static reference → digest table.
///
/// ```yaml
/// python:3.11-slim: sha256:3f1e...
/// python:3.12-slim:
///   digest: sha256:9a0b...
///   env: { LANG: C.UTF-8 }
/// ```
#[derive(Debug, Clone, Default)]
pub struct PinnedImageSource {
    pins: HashMap<String, PinEntry>,
}

fn pin_key(reference: &ImageRef) -> String {
    format!("{}:{}", reference.name(), reference.tag_or_latest())
}

impl PinnedImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: HashMap<String, PinEntry> =
            serde_yaml::from_str(content).context("Failed to parse pinned image table")?;
        let mut source = Self::new();
        for (reference, entry) in raw {
            let parsed = ImageRef::parse(&reference)
                .with_context(|| format!("Invalid pinned reference {}", reference))?;
            source.pins.insert(pin_key(&parsed), entry);
        }
        Ok(source)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pin file {}", path.display()))?;
        let source = Self::from_yaml(&content)?;
        debug!(path = %path.display(), pins = source.pins.len(), "Loaded pinned images");
        Ok(source)
    }

    pub fn with_pin(mut self, reference: &str, digest: Digest) -> Self {
        if let Ok(parsed) = ImageRef::parse(reference) {
            self.pins.insert(pin_key(&parsed), PinEntry::Digest(digest));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

#[async_trait]
impl ImageSource for PinnedImageSource {
    fn name(&self) -> &'static str {
        "pinned"
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage, BuildError> {
        let Some(entry) = self.pins.get(&pin_key(reference)) else {
            // A digest reference is already immutable.
            return match reference.digest() {
                Some(digest) => Ok(ResolvedImage::new(reference, digest.clone())),
                None => Err(BuildError::image_unavailable(
                    reference.to_string(),
                    "reference is not in the pinned image table",
                )),
            };
        };

        let resolved = match entry {
            PinEntry::Digest(digest) => ResolvedImage::new(reference, digest.clone()),
            PinEntry::Full {
                digest,
                env,
                workdir,
            } => {
                let mut resolved = ResolvedImage::new(reference, digest.clone());
                resolved.env.extend(env.clone());
                resolved.workdir = workdir.clone();
                resolved
            }
        };

        if let Some(requested) = reference.digest() {
            if *requested != resolved.digest {
                return Err(BuildError::image_unavailable(
                    reference.to_string(),
                    format!("pinned digest is {}", resolved.digest),
                ));
            }
        }

        Ok(resolved)
    }
}
