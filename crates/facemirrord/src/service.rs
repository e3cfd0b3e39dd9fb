//! Request pipeline: reconcile the mirror, then classify against it.
//!
//! The mirror root is guarded by one `RwLock`. Reconciliation takes the write
//! side and downgrades to a read guard for the classification that follows,
//! so no match pass ever sees a half-synchronized gallery. Plain matches only
//! hold read guards and run side by side.

use crate::config::{Config, SyncPolicy};
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::scratch::ScratchFile;
use base64::Engine as _;
use facemirror_core::{
    BlobStore, ErrorKind, MatchEngine, MatchResult, Matcher, Mirror, ModelComparison, StoreError,
    SyncError, SyncPlan, SyncReport, Synchronizer,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const MAX_NAME_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync failed: {0}")]
    Sync(SyncError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::ValidationError,
            ServiceError::Store(_) | ServiceError::Sync(SyncError::Store(_)) => ErrorKind::StoreError,
            ServiceError::Sync(_) | ServiceError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<SyncError> for ServiceError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(store) => ServiceError::Store(store),
            other => ServiceError::Sync(other),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub name: String,
    pub key: String,
    /// Post-upload reconciliation, absent if it failed.
    pub sync: Option<SyncReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub version: &'static str,
    pub bucket: String,
    pub store: String,
    pub mirror_root: String,
    pub models: Vec<String>,
    pub metric: String,
    pub threshold: f64,
}

/// A mirror root plus the lock that serializes reconciles against matches.
pub struct Gallery {
    synchronizer: Synchronizer,
    lock: RwLock<()>,
}

impl Gallery {
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self {
            synchronizer,
            lock: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        self.synchronizer.store()
    }

    /// Reconcile under the write lock, then hand back a read guard so the
    /// caller's first match pass sees exactly the state just synced.
    pub async fn synced_read(
        &self,
        policy: SyncPolicy,
    ) -> Result<RwLockReadGuard<'_, ()>, ServiceError> {
        let guard = self.lock.write().await;
        match self.synchronizer.reconcile().await {
            Ok(report) if !report.is_complete() => {
                tracing::warn!(
                    failed = report.failures.len(),
                    "matching against a partially synchronized mirror"
                );
            }
            Ok(_) => {}
            Err(SyncError::Store(e)) if policy == SyncPolicy::Degraded => {
                tracing::warn!(error = %e, "store unreachable; matching against last-good mirror");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(RwLockWriteGuard::downgrade(guard))
    }

    pub async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.lock.write().await;
        self.synchronizer.reconcile().await
    }

    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        let _guard = self.lock.read().await;
        self.synchronizer.plan().await
    }
}

pub struct FaceService {
    config: Config,
    gallery: Gallery,
    engine: EngineHandle,
}

impl FaceService {
    pub fn new(
        config: Config,
        store: Arc<dyn BlobStore>,
        matcher: Arc<dyn Matcher>,
    ) -> Result<Self, ServiceError> {
        let synchronizer = Synchronizer::new(store, Mirror::new(&config.mirror_root))
            .with_timeout(config.store_timeout())
            .with_concurrency(config.sync_concurrency);
        let engine = spawn_engine(MatchEngine::new(matcher))?;
        Ok(Self {
            config,
            gallery: Gallery::new(synchronizer),
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn stage_probe(&self, bytes: &[u8]) -> Result<ScratchFile, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("image payload is empty".into()));
        }
        // Unknown formats are still staged; the matcher reports them as decode errors.
        let extension = image::guess_format(bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("img");
        ScratchFile::create(&self.config.scratch_dir, bytes, extension)
            .map_err(|e| ServiceError::Internal(format!("cannot stage probe image: {e}")))
    }

    /// Classify a probe with the primary model.
    pub async fn recognize(&self, bytes: &[u8]) -> Result<MatchResult, ServiceError> {
        let config = self
            .config
            .primary_model()
            .ok_or_else(|| ServiceError::Internal("no model configured".into()))?;
        let probe = self.stage_probe(bytes)?;

        let _guard = self.gallery.synced_read(self.config.sync_policy).await?;
        let result = self
            .engine
            .classify(probe.path_buf(), self.config.mirror_root.clone(), config)
            .await?;
        tracing::info!(status = result.status(), "recognize done");
        Ok(result)
    }

    /// Classify a probe with every configured model.
    pub async fn compare_models(&self, bytes: &[u8]) -> Result<ModelComparison, ServiceError> {
        let probe = self.stage_probe(bytes)?;

        let _guard = self.gallery.synced_read(self.config.sync_policy).await?;
        let comparison = self
            .engine
            .compare(
                probe.path_buf(),
                self.config.mirror_root.clone(),
                self.config.model_configs(),
            )
            .await?;
        Ok(comparison)
    }

    /// Upload a new gallery image, then reconcile so the next request sees it.
    pub async fn register(
        &self,
        name: &str,
        image_base64: &str,
    ) -> Result<RegisterOutcome, ServiceError> {
        let name = validate_name(name)?;
        let bytes = decode_base64_image(image_base64)?;
        let format = image::guess_format(&bytes)
            .map_err(|_| ServiceError::Validation("image is not a recognized image format".into()))?;
        let extension = format.extensions_str().first().copied().unwrap_or("jpg");

        let key = format!("{name}/{name}_{}.{extension}", uuid::Uuid::new_v4());
        let store = self.gallery.store().clone();
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, store.put(&key, bytes)).await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout(timeout).into()),
        }
        tracing::info!(name = %name, key = %key, store = %store.name(), "face uploaded");

        let sync = match self.gallery.reconcile().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "post-registration sync failed");
                None
            }
        };

        Ok(RegisterOutcome {
            name: name.to_string(),
            key,
            sync,
        })
    }

    /// Reconcile on demand.
    pub async fn sync_now(&self) -> Result<SyncReport, ServiceError> {
        Ok(self.gallery.reconcile().await?)
    }

    /// What a reconcile would do right now, without doing it.
    pub async fn plan(&self) -> Result<SyncPlan, ServiceError> {
        Ok(self.gallery.plan().await?)
    }

    pub fn status(&self) -> StatusInfo {
        StatusInfo {
            version: env!("CARGO_PKG_VERSION"),
            bucket: self.config.bucket.clone(),
            store: self.gallery.store().name().to_string(),
            mirror_root: self.config.mirror_root.display().to_string(),
            models: self.config.models.clone(),
            metric: self.config.metric.to_string(),
            threshold: self.config.threshold,
        }
    }
}

/// Identity names become a single directory level in the store.
fn validate_name(name: &str) -> Result<&str, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(ServiceError::Validation("name must not start with '.'".into()));
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(ServiceError::Validation(
            "name must not contain path separators or control characters".into(),
        ));
    }
    Ok(name)
}

/// Accepts plain base64 or a `data:<mime>;base64,` URL.
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, ServiceError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if payload.is_empty() {
        return Err(ServiceError::Validation("image is required".into()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| ServiceError::Validation(format!("image is not valid base64: {e}")))
}
