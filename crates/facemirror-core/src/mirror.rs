//! Local on-disk replica of the gallery.
//!
//! Files are addressed by the same `/`-separated keys the blob store uses.
//! Derived cache artifacts (`*.idx`) live directly under the root and are
//! never part of the key space.

use crate::store::key_from_relative;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension shared by every derived cache artifact.
pub const CACHE_ARTIFACT_EXTENSION: &str = "idx";

const CACHE_ARTIFACT_PREFIX: &str = "representations_";

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("key {0:?} does not map to a path inside the mirror")]
    InvalidKey(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl MirrorError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        MirrorError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether `path` names a derived cache artifact.
pub fn is_cache_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(CACHE_ARTIFACT_EXTENSION))
}

/// Handle on a mirror root. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), MirrorError> {
        std::fs::create_dir_all(&self.root).map_err(|e| MirrorError::io(&self.root, e))
    }

    /// Path of the cache artifact for one model.
    pub fn cache_artifact_path(&self, model_id: &str) -> PathBuf {
        let safe: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root
            .join(format!("{CACHE_ARTIFACT_PREFIX}{safe}.{CACHE_ARTIFACT_EXTENSION}"))
    }

    /// Every materialized file, as canonical `/`-separated keys.
    pub fn local_keys(&self) -> Result<BTreeSet<String>, MirrorError> {
        let mut keys = BTreeSet::new();
        if !self.root.exists() {
            return Ok(keys);
        }
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() || is_cache_artifact(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            match key_from_relative(rel) {
                Some(key) => {
                    keys.insert(key);
                }
                None => {
                    tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 mirror path");
                }
            }
        }
        Ok(keys)
    }

    /// Map a key to its destination path, refusing anything that escapes the root.
    pub fn path_for_key(&self, key: &str) -> Result<PathBuf, MirrorError> {
        if crate::store::validate_key(key).is_err() || key.ends_with('/') {
            return Err(MirrorError::InvalidKey(key.to_string()));
        }
        let path = key.split('/').fold(self.root.clone(), |p, part| p.join(part));
        if is_cache_artifact(&path) && path.parent() == Some(self.root.as_path()) {
            return Err(MirrorError::InvalidKey(key.to_string()));
        }
        Ok(path)
    }

    /// Write `bytes` under `key` via a temp file in the destination directory,
    /// so readers never observe a partially written image.
    pub fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, MirrorError> {
        let dest = self.path_for_key(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| MirrorError::InvalidKey(key.to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(parent)
            .map_err(|e| MirrorError::io(parent, e))?;
        tmp.write_all(bytes).map_err(|e| MirrorError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| MirrorError::io(&dest, e))?;
        tmp.persist(&dest).map_err(|e| MirrorError::io(&dest, e.error))?;
        Ok(dest)
    }

    /// Remove the file for `key`, then prune parent directories left empty
    /// (never the root itself). A missing file is not an error.
    pub fn remove_key(&self, key: &str) -> Result<(), MirrorError> {
        let path = self.path_for_key(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MirrorError::io(&path, e)),
        }

        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk.
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Cache artifacts currently present under the root.
    pub fn cache_artifacts(&self) -> Result<Vec<PathBuf>, MirrorError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MirrorError::io(&self.root, e)),
        };
        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MirrorError::io(&self.root, e))?;
            let path = entry.path();
            if path.is_file() && is_cache_artifact(&path) {
                artifacts.push(path);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Delete every cache artifact. Returns how many were removed.
    pub fn invalidate_cache(&self) -> Result<usize, MirrorError> {
        let mut removed = 0;
        for path in self.cache_artifacts()? {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "cache artifact removed");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(MirrorError::io(&path, e)),
            }
        }
        Ok(removed)
    }
}
