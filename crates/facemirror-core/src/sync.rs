//! Reconciliation of the local mirror against the remote blob store.
//!
//! A pass lists remote keys, enumerates local keys, diffs the two sets, then
//! downloads what is missing and deletes what is gone. Any applied change
//! invalidates the derived cache artifacts so the matcher rebuilds its index.

use crate::mirror::{is_cache_artifact, Mirror, MirrorError};
use crate::store::{BlobStore, StoreError};
use crate::types::is_folder_placeholder;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The store could not be listed at all; the mirror was left untouched.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("sync task failed: {0}")]
    Task(String),
}

/// Keys to fetch and keys to drop for one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub to_download: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl SyncPlan {
    /// `to_download = remote - local`, `to_delete = local - remote`.
    pub fn compute(remote: &BTreeSet<String>, local: &BTreeSet<String>) -> Self {
        Self {
            to_download: remote.difference(local).cloned().collect(),
            to_delete: local.difference(remote).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_download.len() + self.to_delete.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Download,
    Delete,
}

/// A single key that could not be applied.
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub key: String,
    pub op: SyncOp,
    pub message: String,
}

/// Outcome of [`Synchronizer::reconcile`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub plan: SyncPlan,
    /// True when the plan was non-empty and the mirror was touched.
    pub applied: bool,
    pub downloaded: usize,
    pub deleted: usize,
    /// Remote keys left out of the key space (folder markers, cache artifacts).
    pub ignored: Vec<String>,
    pub failures: Vec<SyncFailure>,
    pub cache_invalidated: usize,
}

impl SyncReport {
    /// False when at least one key failed to apply.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns all mutation of one mirror root.
pub struct Synchronizer {
    store: Arc<dyn BlobStore>,
    mirror: Mirror,
    timeout: Duration,
    concurrency: usize,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn BlobStore>, mirror: Mirror) -> Self {
        Self {
            store,
            mirror,
            timeout: DEFAULT_STORE_TIMEOUT,
            concurrency: DEFAULT_SYNC_CONCURRENCY,
        }
    }

    /// Bound every individual store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum number of downloads in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Compute the plan without touching the mirror.
    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        let (remote, _) = self.remote_keys().await?;
        let local = self.local_keys().await?;
        Ok(SyncPlan::compute(&remote, &local))
    }

    /// Bring the mirror in line with the store.
    ///
    /// Fails only when the store cannot be listed or the mirror cannot be
    /// enumerated; per-key failures are collected in the report.
    #[tracing::instrument(skip(self), fields(store = %self.store.name(), root = %self.mirror.root().display()))]
    pub async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        let (remote, ignored) = self.remote_keys().await?;

        let mirror = self.mirror.clone();
        tokio::task::spawn_blocking(move || mirror.ensure_root())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;
        let local = self.local_keys().await?;

        let plan = SyncPlan::compute(&remote, &local);
        let mut report = SyncReport {
            plan,
            ignored,
            ..SyncReport::default()
        };

        if report.plan.is_empty() {
            tracing::debug!(files = local.len(), "mirror already in sync");
            return Ok(report);
        }

        tracing::info!(
            download = report.plan.to_download.len(),
            delete = report.plan.to_delete.len(),
            "applying sync plan"
        );

        let downloads: Vec<(String, Result<(), String>)> =
            stream::iter(report.plan.to_download.iter().cloned())
                .map(|key| async move {
                    let result = self.download(&key).await;
                    (key, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        for (key, result) in downloads {
            match result {
                Ok(()) => report.downloaded += 1,
                Err(message) => {
                    tracing::warn!(key = %key, error = %message, "download failed");
                    report.failures.push(SyncFailure {
                        key,
                        op: SyncOp::Download,
                        message,
                    });
                }
            }
        }

        let mirror = self.mirror.clone();
        let to_delete: Vec<String> = report.plan.to_delete.iter().cloned().collect();
        let deletions = tokio::task::spawn_blocking(move || {
            to_delete
                .into_iter()
                .map(|key| {
                    let result = mirror.remove_key(&key).map_err(|e| e.to_string());
                    (key, result)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?;

        for (key, result) in deletions {
            match result {
                Ok(()) => {
                    tracing::debug!(key = %key, "deleted stale file");
                    report.deleted += 1;
                }
                Err(message) => {
                    tracing::warn!(key = %key, error = %message, "delete failed");
                    report.failures.push(SyncFailure {
                        key,
                        op: SyncOp::Delete,
                        message,
                    });
                }
            }
        }

        report.applied = true;
        let mirror = self.mirror.clone();
        report.cache_invalidated = tokio::task::spawn_blocking(move || mirror.invalidate_cache())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        if report.is_complete() {
            tracing::info!(
                downloaded = report.downloaded,
                deleted = report.deleted,
                cache_invalidated = report.cache_invalidated,
                "mirror synchronized"
            );
        } else {
            tracing::warn!(
                downloaded = report.downloaded,
                deleted = report.deleted,
                failed = report.failures.len(),
                "mirror partially synchronized"
            );
        }
        Ok(report)
    }

    /// Remote key space, minus folder markers and cache-artifact names.
    async fn remote_keys(&self) -> Result<(BTreeSet<String>, Vec<String>), SyncError> {
        let objects = self.bounded(self.store.list()).await?;
        let mut keys = BTreeSet::new();
        let mut ignored = Vec::new();
        for object in objects {
            if is_folder_placeholder(&object.key) || is_cache_artifact(Path::new(&object.key)) {
                tracing::debug!(key = %object.key, "ignoring remote key");
                ignored.push(object.key);
            } else {
                keys.insert(object.key);
            }
        }
        Ok((keys, ignored))
    }

    async fn local_keys(&self) -> Result<BTreeSet<String>, SyncError> {
        let mirror = self.mirror.clone();
        let keys = tokio::task::spawn_blocking(move || mirror.local_keys())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;
        Ok(keys)
    }

    async fn download(&self, key: &str) -> Result<(), String> {
        let bytes = self
            .bounded(self.store.get(key))
            .await
            .map_err(|e| e.to_string())?;
        let mirror = self.mirror.clone();
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || mirror.write_atomic(&key_owned, &bytes))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        tracing::debug!(key, "downloaded");
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;
    use tempfile::TempDir;

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn fixture(objects: &[(&str, &[u8])]) -> (TempDir, Arc<MemoryBlobStore>, Synchronizer) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryBlobStore::with_objects(
            objects.iter().map(|(k, v)| (k.to_string(), v.to_vec())),
        ));
        let sync = Synchronizer::new(store.clone(), Mirror::new(dir.path().join("mirror")));
        (dir, store, sync)
    }

    #[test]
    fn test_plan_is_set_difference() {
        let remote = set(&["a/1.jpg", "b/1.jpg", "c.jpg"]);
        let local = set(&["b/1.jpg", "c.jpg", "d/old.jpg"]);
        let plan = SyncPlan::compute(&remote, &local);
        assert_eq!(plan.to_download, set(&["a/1.jpg"]));
        assert_eq!(plan.to_delete, set(&["d/old.jpg"]));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_identical_sets_is_empty() {
        let keys = set(&["a/1.jpg"]);
        assert!(SyncPlan::compute(&keys, &keys).is_empty());
        assert!(SyncPlan::compute(&BTreeSet::new(), &BTreeSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_downloads_then_is_idempotent() {
        let (_dir, _store, sync) = fixture(&[("alice/img1.jpg", b"a"), ("bob.jpg", b"b")]);

        let first = sync.reconcile().await.unwrap();
        assert!(first.applied);
        assert_eq!(first.downloaded, 2);
        assert!(first.is_complete());
        assert_eq!(
            std::fs::read(sync.mirror().root().join("alice/img1.jpg")).unwrap(),
            b"a"
        );

        let second = sync.reconcile().await.unwrap();
        assert!(!second.applied);
        assert!(second.plan.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_deletes_removed_keys() {
        let (_dir, store, sync) = fixture(&[("alice/img1.jpg", b"a"), ("bob/1.jpg", b"b")]);
        sync.reconcile().await.unwrap();

        store.delete("bob/1.jpg").await.unwrap();
        let report = sync.reconcile().await.unwrap();
        assert_eq!(report.plan.to_delete, set(&["bob/1.jpg"]));
        assert_eq!(report.deleted, 1);
        assert!(!sync.mirror().root().join("bob").exists());
        assert!(sync.mirror().root().join("alice/img1.jpg").exists());
    }

    #[tokio::test]
    async fn test_change_invalidates_cache_and_noop_keeps_it() {
        let (_dir, store, sync) = fixture(&[("carol/face.jpg", b"c")]);
        sync.reconcile().await.unwrap();

        let artifact = sync.mirror().cache_artifact_path("gray-32");
        std::fs::write(&artifact, b"{}").unwrap();

        let noop = sync.reconcile().await.unwrap();
        assert!(!noop.applied);
        assert!(artifact.exists());

        store.put("dave/x.jpg", b"d".to_vec()).await.unwrap();
        let report = sync.reconcile().await.unwrap();
        assert_eq!(report.plan.to_download, set(&["dave/x.jpg"]));
        assert_eq!(report.cache_invalidated, 1);
        assert!(!artifact.exists());
        assert!(sync.mirror().root().join("dave/x.jpg").exists());
    }

    #[tokio::test]
    async fn test_folder_placeholders_are_skipped() {
        let (_dir, _store, sync) = fixture(&[("alice/", b""), ("alice/img1.jpg", b"a")]);
        let report = sync.reconcile().await.unwrap();
        assert_eq!(report.ignored, vec!["alice/".to_string()]);
        assert_eq!(report.downloaded, 1);

        let again = sync.reconcile().await.unwrap();
        assert!(again.plan.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_continues() {
        let (_dir, store, sync) = fixture(&[("a/1.jpg", b"1"), ("b/1.jpg", b"2"), ("c/1.jpg", b"3")]);
        store.fail_get("b/1.jpg");

        let report = sync.reconcile().await.unwrap();
        assert!(report.applied);
        assert!(!report.is_complete());
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "b/1.jpg");
        assert_eq!(report.failures[0].op, SyncOp::Download);
        assert!(!sync.mirror().root().join("b/1.jpg").exists());

        store.clear_failures();
        let retry = sync.reconcile().await.unwrap();
        assert_eq!(retry.plan.to_download, set(&["b/1.jpg"]));
        assert!(retry.is_complete());
    }

    #[tokio::test]
    async fn test_unavailable_store_leaves_mirror_untouched() {
        let (_dir, store, sync) = fixture(&[("a/1.jpg", b"1")]);
        sync.reconcile().await.unwrap();
        let artifact = sync.mirror().cache_artifact_path("gray-32");
        std::fs::write(&artifact, b"{}").unwrap();

        store.set_unavailable(true);
        let err = sync.reconcile().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
        assert!(sync.mirror().root().join("a/1.jpg").exists());
        assert!(artifact.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_listing_times_out() {
        let (_dir, store, sync) = fixture(&[("a/1.jpg", b"1")]);
        let sync = sync.with_timeout(Duration::from_secs(1));
        store.set_list_delay(Some(Duration::from_secs(5)));

        let err = sync.reconcile().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Timeout(_))));
        assert!(!sync.mirror().root().join("a/1.jpg").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_fails_only_that_key() {
        let (_dir, store, sync) = fixture(&[("a/1.jpg", b"1"), ("b/1.jpg", b"2"), ("c/1.jpg", b"3")]);
        let sync = sync.with_timeout(Duration::from_secs(1));
        store.set_get_delay("b/1.jpg", Some(Duration::from_secs(5)));

        let report = sync.reconcile().await.unwrap();
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "b/1.jpg");
        assert_eq!(report.failures[0].op, SyncOp::Download);
        assert!(report.failures[0].message.contains("timed out"));

        let root = sync.mirror().root();
        assert!(root.join("a/1.jpg").exists());
        assert!(root.join("c/1.jpg").exists());
        assert!(!root.join("b/1.jpg").exists());
        let leftovers: Vec<_> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".partial-"))
            .collect();
        assert!(leftovers.is_empty(), "partial files left: {leftovers:?}");

        store.set_get_delay("b/1.jpg", None);
        let report = sync.reconcile().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_dry_run_plan_has_no_effects() {
        let (_dir, _store, sync) = fixture(&[("a/1.jpg", b"1")]);
        let plan = sync.plan().await.unwrap();
        assert_eq!(plan.to_download, set(&["a/1.jpg"]));
        assert!(!sync.mirror().root().join("a/1.jpg").exists());
    }
}
