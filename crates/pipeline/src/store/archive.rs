//! Deterministic layer archives
//!
//! A layer diff is a tar stream with normalised headers (mtime 0, uid/gid 0,
//! modes reduced to 0644/0755) so identical trees always hash the same. The
//! uncompressed stream is hashed into the diff id while it is gzip-compressed
//! onto disk.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use slipway_core::digest::Digest;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tar::{EntryType, Header};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A finished, not yet committed layer archive.
///
/// The backing file is removed on drop unless the store persists it.
#[derive(Debug)]
pub struct PendingDiff {
    pub file: NamedTempFile,
    pub diff_id: Digest,
    /// Uncompressed size of the tar stream
    pub size: u64,
    pub entries: usize,
}

pub struct DiffBuilder {
    builder: tar::Builder<HashingWriter<GzEncoder<NamedTempFile>>>,
    entries: usize,
}

fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Join an image path prefix and a relative path using `/` separators
pub fn image_path(prefix: &str, relative: &Path) -> String {
    let prefix = prefix.trim_matches('/');
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    match (prefix.is_empty(), relative.is_empty()) {
        (true, _) => relative,
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, relative),
    }
}

impl DiffBuilder {
    pub fn create(ingest_dir: &Path) -> Result<Self> {
        fs::create_dir_all(ingest_dir)
            .with_context(|| format!("Failed to create {}", ingest_dir.display()))?;
        let file = NamedTempFile::new_in(ingest_dir)
            .with_context(|| format!("Failed to create layer file in {}", ingest_dir.display()))?;
        let writer = HashingWriter {
            inner: GzEncoder::new(file, Compression::default()),
            hasher: Sha256::new(),
            written: 0,
        };
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Deterministic);
        Ok(Self {
            builder,
            entries: 0,
        })
    }

    /// Add a directory entry and all of its parents
    pub fn append_dir_all(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.trim_matches('/').split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            self.append_dir(&current)?;
        }
        Ok(())
    }

    pub fn append_dir(&mut self, path: &str) -> Result<()> {
        let mut header = header(EntryType::Directory, DIR_MODE, 0);
        self.builder
            .append_data(&mut header, format!("{}/", path.trim_end_matches('/')), io::empty())
            .with_context(|| format!("Failed to add directory {}", path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_file(&mut self, path: &str, source: &Path) -> Result<()> {
        let metadata = fs::metadata(source)
            .with_context(|| format!("Failed to stat {}", source.display()))?;
        let mode = if is_executable(&metadata) {
            EXEC_MODE
        } else {
            FILE_MODE
        };
        let mut header = header(EntryType::Regular, mode, metadata.len());
        let file =
            File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
        self.builder
            .append_data(&mut header, path, file)
            .with_context(|| format!("Failed to add {} to layer", source.display()))?;
        self.entries += 1;
        Ok(())
    }

    /// Add a regular file from bytes already read into memory
    pub fn append_bytes(&mut self, path: &str, content: &[u8], executable: bool) -> Result<()> {
        let mode = if executable { EXEC_MODE } else { FILE_MODE };
        let mut header = header(EntryType::Regular, mode, content.len() as u64);
        self.builder
            .append_data(&mut header, path, content)
            .with_context(|| format!("Failed to add {} to layer", path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_symlink(&mut self, path: &str, target: &Path) -> Result<()> {
        let mut header = header(EntryType::Symlink, 0o777, 0);
        self.builder
            .append_link(&mut header, path, target)
            .with_context(|| format!("Failed to add symlink {}", path))?;
        self.entries += 1;
        Ok(())
    }

    /// Add everything below `source` under `prefix`, in sorted order
    pub fn append_tree(&mut self, source: &Path, prefix: &str) -> Result<()> {
        for entry in WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry =
                entry.with_context(|| format!("Failed to walk {}", source.display()))?;
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
            let path = image_path(prefix, relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.append_dir(&path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
                self.append_symlink(&path, &target)?;
            } else {
                self.append_file(&path, entry.path())?;
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(self) -> Result<PendingDiff> {
        let entries = self.entries;
        let writer = self
            .builder
            .into_inner()
            .context("Failed to finalize layer archive")?;
        let diff_id = Digest::parse(&format!("sha256:{}", hex::encode(writer.hasher.finalize())))?;
        let size = writer.written;
        let file = writer
            .inner
            .finish()
            .context("Failed to finish layer compression")?;

        Ok(PendingDiff {
            file,
            diff_id,
            size,
            entries,
        })
    }
}

/// Unpack a compressed layer blob into `root`
pub fn unpack(blob: &Path, root: &Path) -> Result<()> {
    let file = File::open(blob).with_context(|| format!("Failed to open blob {}", blob.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(root)
        .with_context(|| format!("Failed to unpack {} into {}", blob.display(), root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(dir: &Path) {
        fs::create_dir_all(dir.join("pkg")).unwrap();
        fs::write(dir.join("app.py"), "print('hi')\n").unwrap();
        fs::write(dir.join("pkg/__init__.py"), "").unwrap();
    }

    #[test]
    fn test_image_path() {
        assert_eq!(image_path("/app", Path::new("pkg/a.py")), "app/pkg/a.py");
        assert_eq!(image_path("/", Path::new("a.py")), "a.py");
        assert_eq!(image_path("/usr/local", Path::new("")), "usr/local");
    }

    #[test]
    fn test_identical_trees_share_diff_id() {
        let ingest = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        sample_tree(a.path());
        sample_tree(b.path());

        let mut first = DiffBuilder::create(ingest.path()).unwrap();
        first.append_tree(a.path(), "/app").unwrap();
        let first = first.finish().unwrap();

        let mut second = DiffBuilder::create(ingest.path()).unwrap();
        second.append_tree(b.path(), "/app").unwrap();
        let second = second.finish().unwrap();

        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.entries, 3);
    }

    #[test]
    fn test_content_change_changes_diff_id() {
        let ingest = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        sample_tree(dir.path());

        let mut before = DiffBuilder::create(ingest.path()).unwrap();
        before.append_tree(dir.path(), "/app").unwrap();
        let before = before.finish().unwrap();

        fs::write(dir.path().join("app.py"), "print('bye')\n").unwrap();
        let mut after = DiffBuilder::create(ingest.path()).unwrap();
        after.append_tree(dir.path(), "/app").unwrap();
        let after = after.finish().unwrap();

        assert_ne!(before.diff_id, after.diff_id);
    }

    #[test]
    fn test_unpack_restores_tree() {
        let ingest = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        sample_tree(source.path());

        let mut builder = DiffBuilder::create(ingest.path()).unwrap();
        builder.append_dir_all("/app").unwrap();
        builder.append_tree(source.path(), "/app").unwrap();
        let diff = builder.finish().unwrap();

        unpack(diff.file.path(), root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("app/app.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(root.path().join("app/pkg/__init__.py").exists());
    }

    #[test]
    fn test_pending_diff_removed_on_drop() {
        let ingest = TempDir::new().unwrap();
        let builder = DiffBuilder::create(ingest.path()).unwrap();
        let diff = builder.finish().unwrap();
        let path = diff.file.path().to_path_buf();
        assert!(path.exists());
        drop(diff);
        assert!(!path.exists());
    }
}
