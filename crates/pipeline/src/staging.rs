//! Build context scanning
//!
//! The context is walked once per staging step in sorted order. Paths matched
//! by the root `.dockerignore` are skipped and never reach the layer or its
//! cache key.

use crate::store::archive::{image_path, DiffBuilder};
use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use slipway_core::digest::{Digest, DigestBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const IGNORE_FILE: &str = ".dockerignore";
const CONTEXT_DIGEST_DOMAIN: &str = "slipway.context.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the context root
    pub relative: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub struct ContextTree {
    root: PathBuf,
    entries: Vec<ContextEntry>,
}

fn load_ignore(root: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    let ignore_path = root.join(IGNORE_FILE);
    if ignore_path.exists() {
        if let Some(err) = builder.add(&ignore_path) {
            return Err(err).with_context(|| format!("Invalid {}", ignore_path.display()));
        }
        debug!(path = %ignore_path.display(), "Loaded context ignore patterns");
    }
    builder.build().context("Failed to build ignore matcher")
}

impl ContextTree {
    /// Walk `root`, honouring `.dockerignore`
    pub fn scan(root: &Path) -> Result<Self> {
        let metadata = fs::metadata(root)
            .with_context(|| format!("Build context {} is not readable", root.display()))?;
        if !metadata.is_dir() {
            anyhow::bail!("Build context {} is not a directory", root.display());
        }

        let matcher = load_ignore(root)?;
        let walk_root = root.to_path_buf();
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let relative = entry.path().strip_prefix(&walk_root).unwrap_or(entry.path());
                if relative.as_os_str().is_empty() || relative == Path::new(IGNORE_FILE) {
                    return true;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                !matcher.matched_path_or_any_parents(relative, is_dir).is_ignore()
            })
            .build();

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            if relative.as_os_str().is_empty() {
                continue;
            }

            let Some(file_type) = entry.file_type() else {
                warn!("Skipping context entry of unknown type: {}", relative.display());
                continue;
            };

            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
                EntryKind::Symlink(target)
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                warn!("Skipping special file in context: {}", relative.display());
                continue;
            };

            entries.push(ContextEntry { relative, kind });
        }

        debug!(root = %root.display(), entries = entries.len(), "Scanned build context");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    /// A tree holding only `relative`, or nothing when it does not exist
    pub fn single_file(root: &Path, relative: &str) -> Result<Self> {
        let path = root.join(relative);
        let mut entries = Vec::new();
        if path.is_file() {
            entries.push(ContextEntry {
                relative: PathBuf::from(relative),
                kind: EntryKind::File,
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn read_file(&self, relative: &Path) -> Result<(Vec<u8>, bool)> {
        let path = self.root.join(relative);
        let content =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok((content, is_executable(&path)))
    }

    /// Content digest: paths, kinds, modes and file bytes, in walk order
    pub fn digest(&self) -> Result<Digest> {
        let mut builder = DigestBuilder::new(CONTEXT_DIGEST_DOMAIN);
        for entry in &self.entries {
            match &entry.kind {
                EntryKind::File => {
                    let (content, executable) = self.read_file(&entry.relative)?;
                    fold_entry(&mut builder, entry, Some((&content, executable)));
                }
                _ => fold_entry(&mut builder, entry, None),
            }
        }
        Ok(builder.finish())
    }

    /// Append every entry under `workdir`; parent directories are added by the caller.
    ///
    /// Each file is read once and the returned digest covers exactly the
    /// bytes written, so it can be compared with an earlier [`digest`](Self::digest).
    pub fn write_into(&self, diff: &mut DiffBuilder, workdir: &str) -> Result<Digest> {
        let mut builder = DigestBuilder::new(CONTEXT_DIGEST_DOMAIN);
        for entry in &self.entries {
            let path = image_path(workdir, &entry.relative);
            match &entry.kind {
                EntryKind::Dir => {
                    fold_entry(&mut builder, entry, None);
                    diff.append_dir(&path)?
                }
                EntryKind::Symlink(target) => {
                    fold_entry(&mut builder, entry, None);
                    diff.append_symlink(&path, target)?
                }
                EntryKind::File => {
                    if let Some(parent) = entry.relative.parent() {
                        if !parent.as_os_str().is_empty()
                            && !self
                                .entries
                                .iter()
                                .any(|e| e.relative == parent && e.kind == EntryKind::Dir)
                        {
                            diff.append_dir_all(&image_path(workdir, parent))?;
                        }
                    }
                    let (content, executable) = self.read_file(&entry.relative)?;
                    fold_entry(&mut builder, entry, Some((&content, executable)));
                    diff.append_bytes(&path, &content, executable)?
                }
            }
        }
        Ok(builder.finish())
    }
}

/// A scanned context together with the digest its cache key was built from
#[derive(Debug, Clone)]
pub struct StagedContext {
    pub tree: ContextTree,
    pub digest: Digest,
}

fn fold_entry(builder: &mut DigestBuilder, entry: &ContextEntry, file: Option<(&[u8], bool)>) {
    builder.update(entry.relative.to_string_lossy().as_bytes());
    match (&entry.kind, file) {
        (EntryKind::Dir, _) => {
            builder.update(b"dir");
        }
        (EntryKind::Symlink(target), _) => {
            builder.update(b"symlink");
            builder.update(target.to_string_lossy().as_bytes());
        }
        (EntryKind::File, Some((content, executable))) => {
            builder.update(if executable { b"exec" } else { b"file" });
            builder.update(content);
        }
        (EntryKind::File, None) => {
            builder.update(b"file");
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
