use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use slipway_core::digest::Digest;
use slipway_core::image::StepKind;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

const INDEX_SCHEMA_VERSION: i32 = 1;
const INDEX_FILENAME: &str = "index.json";

/// Cache key → layer digest table shared by every build using a cache dir
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    pub schema_version: i32,
    pub entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub layer: Digest,
    pub step: StepKind,
    pub created: DateTime<Utc>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }

    fn parse(content: &str, index_path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_json::from_str(content)
            .with_context(|| format!("Failed to parse index from {}", index_path.display()))
    }

    /// Read-modify-write under an exclusive lock on `index.json`
    pub fn update_with_lock<F>(cache_dir: &Path, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut CacheIndex),
    {
        let index_path = cache_dir.join(INDEX_FILENAME);

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)
            .with_context(|| format!("Failed to open index file {}", index_path.display()))?;

        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", index_path.display()))?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("Failed to read {}", index_path.display()))?;
        let mut index = Self::parse(&content, &index_path)?;

        update_fn(&mut index);

        let content = serde_json::to_string_pretty(&index).context("Failed to serialize index")?;
        file.set_len(0).context("Failed to truncate index file")?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write index to {}", index_path.display()))?;
        file.sync_all().ok();

        debug!(
            "Updated index {} with {} entries",
            index_path.display(),
            index.entries.len()
        );

        Ok(())
    }

    pub fn read_with_lock(cache_dir: &Path) -> Result<Self> {
        let index_path = cache_dir.join(INDEX_FILENAME);

        if !index_path.exists() {
            return Ok(Self::new());
        }

        let mut file = fs::File::open(&index_path)
            .with_context(|| format!("Failed to open index file {}", index_path.display()))?;

        file.lock_shared()
            .with_context(|| format!("Failed to share-lock {}", index_path.display()))?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("Failed to read {}", index_path.display()))?;
        Self::parse(&content, &index_path)
    }

    pub fn get(&self, cache_key: &Digest) -> Option<&IndexEntry> {
        self.entries.get(&cache_key.as_str())
    }

    pub fn insert(&mut self, cache_key: &Digest, layer: Digest, step: StepKind) {
        self.entries.insert(
            cache_key.as_str(),
            IndexEntry {
                layer,
                step,
                created: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_index_reads_empty() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::read_with_lock(dir.path()).unwrap();
        assert!(index.entries.is_empty());
        assert_eq!(index.schema_version, INDEX_SCHEMA_VERSION);
    }

    #[test]
    fn test_update_persists_entries() {
        let dir = TempDir::new().unwrap();
        let key = Digest::sha256("key");
        let layer = Digest::sha256("layer");

        CacheIndex::update_with_lock(dir.path(), |index| {
            index.insert(&key, layer.clone(), StepKind::Stage);
        })
        .unwrap();

        let index = CacheIndex::read_with_lock(dir.path()).unwrap();
        let entry = index.get(&key).unwrap();
        assert_eq!(entry.layer, layer);
        assert_eq!(entry.step, StepKind::Stage);
    }

    #[test]
    fn test_update_shrinks_file() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            CacheIndex::update_with_lock(dir.path(), |index| {
                index.insert(
                    &Digest::sha256(format!("key{}", i)),
                    Digest::sha256("layer"),
                    StepKind::Port,
                );
            })
            .unwrap();
        }
        CacheIndex::update_with_lock(dir.path(), |index| index.entries.clear()).unwrap();

        let index = CacheIndex::read_with_lock(dir.path()).unwrap();
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILENAME), "{not json").unwrap();
        assert!(CacheIndex::read_with_lock(dir.path()).is_err());
    }
}
