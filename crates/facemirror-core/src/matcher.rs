//! Nearest-neighbor search of a probe image against a gallery directory.
//!
//! [`EmbeddingMatcher`] keeps one derived index per model under the gallery
//! root (`representations_<model>.idx`). The index is rebuilt whenever it is
//! missing, unreadable, built for another model, or stale with respect to
//! the gallery listing.

use crate::embedding::{builtin_embedders, EmbedError, Embedder};
use crate::mirror::{is_cache_artifact, Mirror};
use crate::store::key_from_relative;
use crate::types::{DistanceMetric, Embedding, MatchCandidate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("no detectable face in probe image")]
    NoFaceDetected,
    #[error("cannot decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("embedding failed: {0}")]
    Embed(String),
    #[error("gallery index error: {0}")]
    Index(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MatcherError {
    /// Probe-side failures: the request image itself is the problem.
    pub fn is_probe_failure(&self) -> bool {
        matches!(self, MatcherError::NoFaceDetected | MatcherError::Decode { .. })
    }
}

/// Ranks gallery images by distance to a probe.
pub trait Matcher: Send + Sync {
    /// Candidates in ascending distance order; ties keep gallery order.
    /// An empty gallery yields an empty list, not an error.
    fn find(
        &self,
        probe: &Path,
        gallery: &Path,
        model_id: &str,
        metric: DistanceMetric,
    ) -> Result<Vec<MatchCandidate>, MatcherError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    /// `/`-separated path relative to the gallery root.
    path: String,
    embedding: Embedding,
}

/// Serialized form of a cache artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryIndex {
    model_id: String,
    fingerprint: String,
    entries: Vec<IndexEntry>,
}

impl GalleryIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Image files in the gallery as `(key, size)`, sorted by key.
fn gallery_images(gallery: &Path) -> Result<Vec<(String, u64)>, MatcherError> {
    let mut images = Vec::new();
    if !gallery.exists() {
        return Ok(images);
    }
    for entry in walkdir::WalkDir::new(gallery).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| MatcherError::Index(e.to_string()))?;
        if !entry.file_type().is_file() || is_cache_artifact(entry.path()) {
            continue;
        }
        if entry.file_name().to_str().is_some_and(|n| n.starts_with('.')) {
            continue;
        }
        let is_image = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        let Some(key) = entry
            .path()
            .strip_prefix(gallery)
            .ok()
            .and_then(key_from_relative)
        else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        images.push((key, size));
    }
    images.sort();
    Ok(images)
}

fn fingerprint(images: &[(String, u64)]) -> String {
    let mut hasher = Sha256::new();
    for (key, size) in images {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn key_to_path(gallery: &Path, key: &str) -> PathBuf {
    key.split('/').fold(gallery.to_path_buf(), |p, part| p.join(part))
}

fn decode(path: &Path) -> Result<image::DynamicImage, MatcherError> {
    let bytes = std::fs::read(path).map_err(|e| MatcherError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    image::load_from_memory(&bytes).map_err(|e| MatcherError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Matcher backed by per-model embedding indexes.
pub struct EmbeddingMatcher {
    embedders: Vec<Box<dyn Embedder>>,
}

impl EmbeddingMatcher {
    pub fn new(embedders: Vec<Box<dyn Embedder>>) -> Self {
        Self { embedders }
    }

    /// Matcher with every built-in embedder registered.
    pub fn with_builtin() -> Self {
        Self::new(builtin_embedders())
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.embedders.iter().map(|e| e.model_id()).collect()
    }

    fn embedder(&self, model_id: &str) -> Result<&dyn Embedder, MatcherError> {
        self.embedders
            .iter()
            .find(|e| e.model_id() == model_id)
            .map(|e| e.as_ref())
            .ok_or_else(|| MatcherError::UnknownModel(model_id.to_string()))
    }

    /// Load the cached index for `model_id`, rebuilding it if it is stale.
    pub fn load_or_build_index(
        &self,
        gallery: &Path,
        model_id: &str,
    ) -> Result<GalleryIndex, MatcherError> {
        let embedder = self.embedder(model_id)?;
        let images = gallery_images(gallery)?;
        let current = fingerprint(&images);
        let artifact = Mirror::new(gallery).cache_artifact_path(model_id);

        match std::fs::read(&artifact) {
            Ok(bytes) => match serde_json::from_slice::<GalleryIndex>(&bytes) {
                Ok(index) if index.model_id == model_id && index.fingerprint == current => {
                    tracing::debug!(model = model_id, entries = index.len(), "gallery index loaded");
                    return Ok(index);
                }
                Ok(_) => tracing::info!(model = model_id, "gallery index stale; rebuilding"),
                Err(e) => {
                    tracing::warn!(model = model_id, error = %e, "gallery index unreadable; rebuilding")
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut entries = Vec::with_capacity(images.len());
        for (key, _) in &images {
            let path = key_to_path(gallery, key);
            let embedded = decode(&path).and_then(|img| match embedder.embed(&img) {
                Ok(e) => Ok(e),
                Err(EmbedError::NoFaceDetected) => Err(MatcherError::NoFaceDetected),
                Err(e) => Err(MatcherError::Embed(e.to_string())),
            });
            match embedded {
                Ok(embedding) => entries.push(IndexEntry {
                    path: key.clone(),
                    embedding,
                }),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping gallery image"),
            }
        }

        let index = GalleryIndex {
            model_id: model_id.to_string(),
            fingerprint: current,
            entries,
        };
        if gallery.exists() {
            write_index(&artifact, &index)?;
        }
        tracing::info!(
            model = model_id,
            images = images.len(),
            entries = index.len(),
            "gallery index built"
        );
        Ok(index)
    }
}

fn write_index(artifact: &Path, index: &GalleryIndex) -> Result<(), MatcherError> {
    let dir = artifact
        .parent()
        .ok_or_else(|| MatcherError::Index("index path has no parent".into()))?;
    let json = serde_json::to_vec(index).map_err(|e| MatcherError::Index(e.to_string()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".idx")
        .tempfile_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(artifact).map_err(|e| MatcherError::Io(e.error))?;
    Ok(())
}

impl Matcher for EmbeddingMatcher {
    fn find(
        &self,
        probe: &Path,
        gallery: &Path,
        model_id: &str,
        metric: DistanceMetric,
    ) -> Result<Vec<MatchCandidate>, MatcherError> {
        let embedder = self.embedder(model_id)?;
        let probe_image = decode(probe)?;
        let probe_embedding = embedder.embed(&probe_image).map_err(|e| match e {
            EmbedError::NoFaceDetected => MatcherError::NoFaceDetected,
            other => MatcherError::Embed(other.to_string()),
        })?;

        let index = self.load_or_build_index(gallery, model_id)?;

        let mut candidates: Vec<MatchCandidate> = index
            .entries
            .iter()
            .map(|entry| MatchCandidate {
                identity_path: key_to_path(gallery, &entry.path),
                distance: metric.distance(&probe_embedding, &entry.embedding),
            })
            .collect();
        // Stable: equal distances keep index (sorted key) order.
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(candidates)
    }
}
