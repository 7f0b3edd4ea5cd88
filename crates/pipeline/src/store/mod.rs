//! On-disk layer store
//!
//! Layout under the cache directory:
//!
//! ```text
//! blobs/sha256/<diff hex>   gzip-compressed layer tar, named by its diff id
//! layers/<digest hex>.json  layer records
//! images/<name>.json        image records; names that needed escaping
//!                           carry a short hash of the raw name
//! index.json                cache key → layer digest
//! ingest/                   archives still being written
//! ```

pub mod archive;
pub mod index;

pub use archive::{DiffBuilder, PendingDiff};
pub use index::{CacheIndex, IndexEntry};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use slipway_core::digest::{Digest, DigestBuilder};
use slipway_core::image::{BuiltImage, ImageConfig, LayerRecord, StepKind};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

/// What [`LayerStore::prune`] removed
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub layers_removed: usize,
    pub blobs_removed: usize,
    pub bytes_reclaimed: u64,
}

/// Chain identity of a layer: its cache key, its content and the config it leaves behind
pub fn layer_digest(cache_key: &Digest, diff_id: Option<&Digest>, config: &ImageConfig) -> Digest {
    let mut builder = DigestBuilder::new("slipway.layer.v1");
    builder.update_digest(cache_key);
    match diff_id {
        Some(diff_id) => builder.update_digest(diff_id),
        None => builder.update(b""),
    };
    builder.update(config.canonical_bytes());
    builder.finish()
}

fn image_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == name {
        format!("{}.json", sanitized)
    } else {
        let raw = Digest::sha256(name);
        format!("{}-{}.json", sanitized, &raw.hash()[..8])
    }
}

fn write_atomic(dir: &Path, target: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    tmp.persist(target)
        .with_context(|| format!("Failed to move record into {}", target.display()))?;
    Ok(())
}

impl LayerStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.blobs_dir(),
            store.layers_dir(),
            store.images_dir(),
            store.ingest_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        debug!(root = %store.root.display(), "Opened layer store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn ingest_dir(&self) -> PathBuf {
        self.root.join("ingest")
    }

    fn layer_path(&self, digest: &Digest) -> PathBuf {
        self.layers_dir().join(format!("{}.json", digest.hash()))
    }

    pub fn blob_path(&self, diff_id: &Digest) -> PathBuf {
        diff_id.to_blob_path(&self.root)
    }

    /// Find the committed layer for a cache key.
    ///
    /// Index entries whose record or blob has gone missing are treated as misses.
    pub fn lookup(&self, cache_key: &Digest) -> Result<Option<LayerRecord>> {
        let index = CacheIndex::read_with_lock(&self.root)?;
        let Some(entry) = index.get(cache_key) else {
            return Ok(None);
        };

        let record = match self.load_layer(&entry.layer) {
            Ok(record) => record,
            Err(e) => {
                warn!(cache_key = %cache_key, "Ignoring stale cache entry: {:#}", e);
                return Ok(None);
            }
        };

        if record.cache_key != *cache_key {
            warn!(
                cache_key = %cache_key,
                layer = %record.digest,
                "Cache entry points at a foreign layer"
            );
            return Ok(None);
        }

        if let Some(diff_id) = &record.diff_id {
            if !self.blob_path(diff_id).exists() {
                warn!(layer = %record.digest, "Layer blob is missing, rebuilding");
                return Ok(None);
            }
        }

        Ok(Some(record))
    }

    /// Persist a layer: blob first, then the record, then the index entry.
    /// A crash between the steps leaves only unreferenced files behind.
    pub fn commit(&self, record: &LayerRecord, diff: Option<PendingDiff>) -> Result<()> {
        match (&record.diff_id, diff) {
            (Some(diff_id), Some(diff)) => {
                if diff.diff_id != *diff_id {
                    bail!(
                        "Layer {} expects diff {} but archive hashes to {}",
                        record.digest,
                        diff_id,
                        diff.diff_id
                    );
                }
                let blob = self.blob_path(diff_id);
                if blob.exists() {
                    debug!(diff_id = %diff_id, "Blob already present");
                } else {
                    diff.file
                        .persist(&blob)
                        .with_context(|| format!("Failed to store blob {}", blob.display()))?;
                }
            }
            (None, None) => {}
            (Some(diff_id), None) => {
                if !self.blob_path(diff_id).exists() {
                    bail!("Layer {} references missing blob {}", record.digest, diff_id);
                }
            }
            (None, Some(_)) => bail!("Layer {} has an archive but no diff id", record.digest),
        }

        let content =
            serde_json::to_vec_pretty(record).context("Failed to serialize layer record")?;
        write_atomic(&self.layers_dir(), &self.layer_path(&record.digest), &content)?;

        CacheIndex::update_with_lock(&self.root, |index| {
            index.insert(&record.cache_key, record.digest.clone(), record.step);
        })?;

        info!(layer = %record.digest, step = %record.step, "Committed layer");
        Ok(())
    }

    pub fn load_layer(&self, digest: &Digest) -> Result<LayerRecord> {
        let path = self.layer_path(digest);
        let content = fs::read(&path)
            .with_context(|| format!("Failed to read layer record {}", path.display()))?;
        let record: LayerRecord = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse layer record {}", path.display()))?;
        if record.digest != *digest {
            bail!(
                "Layer record {} is corrupt: it claims digest {}",
                path.display(),
                record.digest
            );
        }
        Ok(record)
    }

    /// Extract a layer's filesystem diff into `root`; config-only layers are a no-op
    pub fn apply_layer(&self, record: &LayerRecord, root: &Path) -> Result<()> {
        if let Some(diff_id) = &record.diff_id {
            archive::unpack(&self.blob_path(diff_id), root)
                .with_context(|| format!("Failed to apply layer {}", record.digest))?;
        }
        Ok(())
    }

    /// Materialise a whole chain into `dest`, oldest layer first
    pub fn export_rootfs(&self, layers: &[LayerRecord], dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
        for record in layers {
            self.apply_layer(record, dest)?;
        }
        debug!(dest = %dest.display(), layers = layers.len(), "Exported root filesystem");
        Ok(())
    }

    pub fn save_image(&self, image: &BuiltImage) -> Result<()> {
        let content = serde_json::to_vec_pretty(image).context("Failed to serialize image")?;
        let path = self.images_dir().join(image_file_name(&image.name));
        write_atomic(&self.images_dir(), &path, &content)?;
        info!(image = %image.name, id = %image.id, "Saved image record");
        Ok(())
    }

    pub fn load_image(&self, name: &str) -> Result<BuiltImage> {
        let path = self.images_dir().join(image_file_name(name));
        if !path.exists() {
            bail!("No image named '{}' in {}", name, self.root.display());
        }
        let content =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let image: BuiltImage = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse image record {}", path.display()))?;
        if image.name != name {
            bail!(
                "Image record {} belongs to '{}', not '{}'",
                path.display(),
                image.name,
                name
            );
        }
        Ok(image)
    }

    pub fn list_images(&self) -> Result<Vec<BuiltImage>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(self.images_dir()).context("Failed to read images directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_slice::<BuiltImage>(&c).map_err(Into::into))
            {
                Ok(image) => images.push(image),
                Err(e) => warn!("Skipping unreadable image record {}: {}", path.display(), e),
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    /// Remove layers and blobs that no image record references
    pub fn prune(&self) -> Result<PruneReport> {
        let images = self.list_images()?;
        let keep_layers: HashSet<String> = images
            .iter()
            .flat_map(|i| i.layers.iter().map(|l| l.digest.hash().to_string()))
            .collect();
        let keep_blobs: HashSet<String> = images
            .iter()
            .flat_map(|i| i.layers.iter().filter_map(|l| l.diff_id.as_ref()))
            .map(|d| d.hash().to_string())
            .collect();

        info!("Starting layer store garbage collection...");
        let mut report = PruneReport::default();
        let mut removed_layers = HashSet::new();

        for entry in fs::read_dir(self.layers_dir()).context("Failed to read layers directory")? {
            let path = entry?.path();
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            if keep_layers.contains(&hash) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.layers_removed += 1;
                    removed_layers.insert(hash);
                }
                Err(e) => warn!("Failed to delete layer record {}: {}", path.display(), e),
            }
        }

        for entry in fs::read_dir(self.blobs_dir()).context("Failed to read blobs directory")? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !path.is_file() || keep_blobs.contains(&name) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.blobs_removed += 1;
                    report.bytes_reclaimed += size;
                    debug!("Deleted unreferenced blob: sha256:{}", name);
                }
                Err(e) => warn!("Failed to delete unreferenced blob {}: {}", name, e),
            }
        }

        CacheIndex::update_with_lock(&self.root, |index| {
            index
                .entries
                .retain(|_, entry| !removed_layers.contains(entry.layer.hash()));
        })?;

        info!(
            layers = report.layers_removed,
            blobs = report.blobs_removed,
            bytes = report.bytes_reclaimed,
            "Garbage collection complete"
        );
        Ok(report)
    }

    /// Build a layer record for `step` on top of `parent`
    pub fn seal(
        parent: Option<&Digest>,
        step: StepKind,
        cache_key: Digest,
        diff: Option<&PendingDiff>,
        config: ImageConfig,
        created_by: String,
    ) -> LayerRecord {
        let diff_id = diff.map(|d| d.diff_id.clone());
        let digest = layer_digest(&cache_key, diff_id.as_ref(), &config);
        LayerRecord {
            digest,
            parent: parent.cloned(),
            step,
            cache_key,
            diff_id,
            size: diff.map(|d| d.size).unwrap_or(0),
            config,
            created_by,
        }
    }
}
