//! Remote blob containers holding the reference gallery.
//!
//! The synchronizer only needs list/get/put/delete. [`FsBlobStore`] serves a
//! container laid out on a filesystem (a mounted bucket, a shared volume);
//! [`MemoryBlobStore`] keeps everything in process and can inject failures.

use crate::types::{is_folder_placeholder, RemoteObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// A keyed object container. Keys are `/`-separated; a trailing `/` marks a
/// folder placeholder.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable container name, used in logs.
    fn name(&self) -> &str;

    async fn list(&self) -> Result<Vec<RemoteObject>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Reject keys that would escape the container or are not plain relative paths.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    if trimmed.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    if trimmed
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Container stored as a directory tree: key `a/b.jpg` lives at `<root>/a/b.jpg`.
pub struct FsBlobStore {
    name: String,
    root: PathBuf,
}

impl FsBlobStore {
    /// Open the container `<store_dir>/<bucket>`. The directory must exist.
    pub fn open(store_dir: &Path, bucket: &str) -> Result<Self, StoreError> {
        validate_key(bucket)?;
        let root = store_dir.join(bucket);
        if !root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "container {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            name: bucket.to_string(),
            root,
        })
    }

    /// Open the container, creating its directory if needed.
    pub fn create(store_dir: &Path, bucket: &str) -> Result<Self, StoreError> {
        validate_key(bucket)?;
        let root = store_dir.join(bucket);
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: bucket.to_string(),
            source,
        })?;
        Ok(Self {
            name: bucket.to_string(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let trimmed = key.strip_suffix('/').unwrap_or(key);
        Ok(trimmed
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part)))
    }
}

fn list_tree(root: &Path) -> Result<Vec<RemoteObject>, StoreError> {
    if !root.is_dir() {
        return Err(StoreError::Unavailable(format!(
            "container {} is not reachable",
            root.display()
        )));
    }

    let mut objects = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(key) = key_from_relative(rel) else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 object path");
            continue;
        };

        if entry.file_type().is_dir() {
            let is_empty = std::fs::read_dir(entry.path())
                .map(|mut it| it.next().is_none())
                .unwrap_or(false);
            if is_empty {
                objects.push(RemoteObject::new(format!("{key}/")));
            }
            continue;
        }

        let metadata = entry.metadata().ok();
        objects.push(RemoteObject {
            key,
            size: metadata.as_ref().map(|m| m.len()),
            last_modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        });
    }
    Ok(objects)
}

/// Join the components of a relative path with `/`.
pub(crate) fn key_from_relative(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<RemoteObject>, StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_tree(&root))
            .await
            .map_err(|e| StoreError::Unavailable(format!("listing task failed: {e}")))?
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if is_folder_placeholder(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let path = self.path_for(key)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = path
                .parent()
                .ok_or_else(|| std::io::Error::other("object path has no parent"))?;
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            std::io::Write::write_all(&mut tmp, &bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("upload task failed: {e}")))?
        .map_err(|source| StoreError::Io {
            key: key_owned,
            source,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let result = if is_folder_placeholder(key) {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    unavailable: bool,
    failing_gets: BTreeSet<String>,
    list_delay: Option<Duration>,
    get_delays: BTreeMap<String, Duration>,
    put_delay: Option<Duration>,
}

/// In-process container with failure injection.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryState>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `(key, bytes)` pairs.
    pub fn with_objects<I, K>(objects: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        let store = Self::new();
        {
            let mut state = store.lock();
            for (key, bytes) in objects {
                state.objects.insert(key.into(), bytes);
            }
        }
        store
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make `get(key)` fail until cleared.
    pub fn fail_get(&self, key: impl Into<String>) {
        self.lock().failing_gets.insert(key.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_gets.clear();
        state.unavailable = false;
    }

    /// Delay every `list()` call, for timeout tests.
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.lock().list_delay = delay;
    }

    /// Delay `get(key)` for one key only.
    pub fn set_get_delay(&self, key: impl Into<String>, delay: Option<Duration>) {
        let mut state = self.lock();
        match delay {
            Some(delay) => state.get_delays.insert(key.into(), delay),
            None => state.get_delays.remove(&key.into()),
        };
    }

    pub fn set_put_delay(&self, delay: Option<Duration>) {
        self.lock().put_delay = delay;
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-call; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.lock().unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self) -> Result<Vec<RemoteObject>, StoreError> {
        self.check_available()?;
        let delay = self.lock().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .lock()
            .objects
            .iter()
            .map(|(key, bytes)| RemoteObject {
                key: key.clone(),
                size: Some(bytes.len() as u64),
                last_modified: None,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check_available()?;
        let delay = self.lock().get_delays.get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        if state.failing_gets.contains(key) {
            return Err(StoreError::Io {
                key: key.to_string(),
                source: std::io::Error::other("injected get failure"),
            });
        }
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.check_available()?;
        validate_key(key)?;
        let delay = self.lock().put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
