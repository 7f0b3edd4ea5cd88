use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

const SHA256: &str = "sha256";

/// Represents a content-addressable digest (e.g., "sha256:abc123...")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hash: String,
}

impl Digest {
    /// Parse a digest string in format "algorithm:hash"
    pub fn parse(digest: &str) -> Result<Self> {
        let (algorithm, hash) = digest.split_once(':').with_context(|| {
            format!(
                "Invalid digest format (expected 'algorithm:hash'): {}",
                digest
            )
        })?;

        if algorithm.is_empty() || hash.is_empty() {
            anyhow::bail!("Invalid digest format (empty component): {}", digest);
        }

        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Digest hash must be hex encoded: {}", digest);
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hash.to_lowercase(),
        })
    }

    /// SHA-256 digest of the given bytes
    pub fn sha256(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hash: hex::encode(Sha256::digest(bytes.as_ref())),
        }
    }

    /// Get the algorithm part (e.g., "sha256")
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Get the hash part
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// First 12 hex characters, the way image IDs are usually shown
    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }

    /// Convert digest to blob storage path within a cache directory
    pub fn to_blob_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join("blobs")
            .join(&self.algorithm)
            .join(&self.hash)
    }

    /// Format as "algorithm:hash" string
    pub fn as_str(&self) -> String {
        format!("{}:{}", self.algorithm, self.hash)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl TryFrom<String> for Digest {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.as_str()
    }
}

/// Incremental SHA-256 over length-prefixed parts.
///
/// Every part is framed with its length so that `("ab", "c")` and `("a", "bc")`
/// never collide.
#[derive(Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self::default();
        builder.update(domain.as_bytes());
        builder
    }

    pub fn update(&mut self, part: impl AsRef<[u8]>) -> &mut Self {
        let part = part.as_ref();
        self.hasher.update((part.len() as u64).to_le_bytes());
        self.hasher.update(part);
        self
    }

    pub fn update_digest(&mut self, digest: &Digest) -> &mut Self {
        self.update(digest.as_str())
    }

    pub fn finish(self) -> Digest {
        Digest {
            algorithm: SHA256.to_string(),
            hash: hex::encode(self.hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_digest() {
        let digest = Digest::parse("sha256:abc123").unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hash(), "abc123");
        assert_eq!(digest.to_string(), "sha256:abc123");
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(Digest::parse("invalid").is_err());
        assert!(Digest::parse("").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("sha256:not-hex").is_err());
    }

    #[test]
    fn test_to_blob_path() {
        let digest = Digest::parse("sha256:abc123").unwrap();
        let path = digest.to_blob_path(Path::new("/cache"));
        assert_eq!(path, PathBuf::from("/cache/blobs/sha256/abc123"));
    }

    #[test]
    fn test_sha256_known_value() {
        let digest = Digest::sha256(b"");
        assert_eq!(
            digest.hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.short(), "e3b0c44298fc");
    }

    #[test]
    fn test_builder_frames_parts() {
        let mut a = DigestBuilder::new("test");
        a.update("ab").update("c");
        let mut b = DigestBuilder::new("test");
        b.update("a").update("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_builder_domain_separates() {
        let mut a = DigestBuilder::new("stage");
        a.update("x");
        let mut b = DigestBuilder::new("install");
        b.update("x");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_serde_as_string() {
        let digest = Digest::sha256(b"layer");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
