//! The remote authoritative store, seen from the replication worker.

use crate::types::{Rejection, UpsertBatchResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use shutterbox::{blob_file_name, BlobStore, LocalLog, Record, RecordId, ShutterboxError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Failure of a whole batch. Per-record refusals travel in
/// [`UpsertBatchResponse::rejected`] instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Connectivity or server-side failure; retry later.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// The remote refused the batch as malformed.
    #[error("remote rejected batch: {0}")]
    Rejected(String),
}

impl From<RemoteError> for ShutterboxError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unavailable(msg) => ShutterboxError::RemoteUnavailable(msg),
            RemoteError::Rejected(reason) => ShutterboxError::RemoteRejected {
                id: "batch".to_string(),
                reason,
            },
        }
    }
}

/// Idempotent upsert keyed by record id: the same id applied twice yields
/// one row holding the later copy.
///
/// An `Ok` response means every id in `applied` is durably committed on the
/// remote. An `Err` means nothing in the batch may be treated as committed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert_batch(
        &self,
        node_id: &str,
        records: &[Record],
    ) -> Result<UpsertBatchResponse, RemoteError>;

    /// Store a photo under `id` and return the pointer the remote serves it
    /// at. Called before the record itself is sent.
    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<String, RemoteError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> bool;
}

/// Path the central store serves a shipped photo under.
pub fn upload_path(id: &str) -> String {
    format!("/uploads/{}", blob_file_name(id))
}

/// Structural checks the central store applies to every incoming record.
pub fn validate_record(record: &Record) -> Result<(), String> {
    if record.id.trim().is_empty() {
        return Err("empty id".to_string());
    }
    if record.id.len() > 128 {
        return Err("id longer than 128 bytes".to_string());
    }
    if !(record.metadata.is_object() || record.metadata.is_null()) {
        return Err("metadata must be a JSON object".to_string());
    }
    Ok(())
}

fn split_valid(records: &[Record]) -> (Vec<Record>, Vec<Rejection>) {
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for record in records {
        match validate_record(record) {
            Ok(()) => accepted.push(record.clone()),
            Err(reason) => rejected.push(Rejection {
                id: record.id.clone(),
                reason,
            }),
        }
    }
    (accepted, rejected)
}

/// Central-store side: applies accepted records to a [`LocalLog`] in one
/// commit.
#[derive(Clone)]
pub struct LogRemoteStore {
    log: Arc<LocalLog>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl LogRemoteStore {
    pub fn new(log: Arc<LocalLog>) -> Self {
        LogRemoteStore { log, blobs: None }
    }

    /// Accept photos into `blobs`. Without one, uploads are refused.
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn blobs(&self) -> Option<&Arc<dyn BlobStore>> {
        self.blobs.as_ref()
    }

    /// Synchronous apply, for callers already off the async runtime.
    pub fn apply(&self, records: &[Record]) -> Result<UpsertBatchResponse, RemoteError> {
        let (accepted, rejected) = split_valid(records);
        let applied: Vec<RecordId> = accepted.iter().map(|r| r.id.clone()).collect();
        self.log
            .upsert_replicas(accepted)
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        Ok(UpsertBatchResponse { applied, rejected })
    }
}

#[async_trait]
impl RemoteStore for LogRemoteStore {
    async fn upsert_batch(
        &self,
        node_id: &str,
        records: &[Record],
    ) -> Result<UpsertBatchResponse, RemoteError> {
        let store = self.clone();
        let records = records.to_vec();
        let resp = tokio::task::spawn_blocking(move || store.apply(&records))
            .await
            .map_err(|e| RemoteError::Unavailable(format!("apply task failed: {}", e)))??;

        tracing::info!(
            "[SYNC] applied {} records from {} ({} rejected)",
            resp.applied.len(),
            node_id,
            resp.rejected.len()
        );
        Ok(resp)
    }

    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<String, RemoteError> {
        let Some(blobs) = self.blobs.clone() else {
            return Err(RemoteError::Rejected(
                "this store does not accept photos".to_string(),
            ));
        };
        let key = id.to_string();
        let stored = tokio::task::spawn_blocking(move || blobs.put(&key, &bytes))
            .await
            .map_err(|e| RemoteError::Unavailable(format!("blob task failed: {}", e)))?;
        match stored {
            Ok(_) => {
                tracing::debug!("[SYNC] stored photo {}", id);
                Ok(upload_path(id))
            }
            Err(ShutterboxError::InvalidRecord(reason)) => Err(RemoteError::Rejected(reason)),
            Err(e) => Err(RemoteError::Unavailable(e.to_string())),
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// In-process remote with failure injection.
#[derive(Default)]
pub struct MemoryRemoteStore {
    rows: DashMap<RecordId, Record>,
    blobs: DashMap<RecordId, Vec<u8>>,
    reject_blob: DashMap<RecordId, String>,
    fail_next: AtomicUsize,
    offline: AtomicBool,
    reject: DashMap<RecordId, String>,
    calls: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every batch until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse `id` on every delivery.
    pub fn reject(&self, id: &str, reason: &str) {
        self.reject.insert(id.to_string(), reason.to_string());
    }

    /// Refuse the photo of `id` on every upload.
    pub fn reject_blob(&self, id: &str, reason: &str) {
        self.reject_blob.insert(id.to_string(), reason.to_string());
    }

    /// Photo bytes received for `id`.
    pub fn blob(&self, id: &str) -> Option<Vec<u8>> {
        self.blobs.get(id).map(|b| b.clone())
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.rows.get(id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert_batch(
        &self,
        _node_id: &str,
        records: &[Record],
    ) -> Result<UpsertBatchResponse, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Unavailable("injected failure".into()));
        }

        let (accepted, mut rejected) = split_valid(records);
        // Stage first so a batch is visible all at once or not at all.
        let mut staged: HashMap<RecordId, Record> = HashMap::new();
        for record in accepted {
            if let Some(reason) = self.reject.get(&record.id) {
                rejected.push(Rejection {
                    id: record.id.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            staged.insert(record.id.clone(), record);
        }

        let mut applied = Vec::with_capacity(staged.len());
        for record in records {
            if let Some(r) = staged.remove(&record.id) {
                applied.push(r.id.clone());
                self.rows.insert(r.id.clone(), r);
            }
        }
        Ok(UpsertBatchResponse { applied, rejected })
    }

    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<String, RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote offline".into()));
        }
        if let Some(reason) = self.reject_blob.get(id) {
            return Err(RemoteError::Rejected(reason.clone()));
        }
        self.blobs.insert(id.to_string(), bytes);
        Ok(upload_path(id))
    }

    async fn ping(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_upsert_is_idempotent() {
        let remote = MemoryRemoteStore::new();
        let created = chrono::Utc::now();
        let a = Record::with_id("a")
            .created_at(created)
            .metadata(serde_json::json!({"v": 1}));
        let b = Record::with_id("a")
            .created_at(created)
            .metadata(serde_json::json!({"v": 2}));

        remote.upsert_batch("n", &[a]).await.unwrap();
        remote.upsert_batch("n", &[b]).await.unwrap();

        assert_eq!(remote.len(), 1);
        assert_eq!(remote.get("a").unwrap().metadata["v"], 2);
    }

    #[tokio::test]
    async fn test_memory_injected_failure_writes_nothing() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next(2);
        let batch = vec![Record::with_id("a"), Record::with_id("b")];

        assert!(remote.upsert_batch("n", &batch).await.is_err());
        assert!(remote.upsert_batch("n", &batch).await.is_err());
        assert!(remote.is_empty());

        let resp = remote.upsert_batch("n", &batch).await.unwrap();
        assert_eq!(resp.applied, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(remote.calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_per_record_rejection() {
        let remote = MemoryRemoteStore::new();
        remote.reject("b", "bad phone number");
        let resp = remote
            .upsert_batch("n", &[Record::with_id("a"), Record::with_id("b")])
            .await
            .unwrap();
        assert_eq!(resp.applied, vec!["a".to_string()]);
        assert_eq!(resp.rejected[0].id, "b");
        assert!(remote.get("b").is_none());
    }

    #[test]
    fn test_validate_record() {
        assert!(validate_record(&Record::with_id("ok")).is_ok());
        let bad = Record::with_id("x").metadata(serde_json::json!([1, 2]));
        assert!(validate_record(&bad).is_err());
        assert!(validate_record(&Record::with_id("x".repeat(200))).is_err());
    }

    #[tokio::test]
    async fn test_log_remote_store_marks_replicas() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(LocalLog::open(tmp.path()).unwrap());
        let remote = LogRemoteStore::new(Arc::clone(&log));

        let bad = Record::with_id("bad").metadata(serde_json::json!("scalar"));
        let resp = remote
            .upsert_batch("kiosk-1", &[Record::with_id("good"), bad])
            .await
            .unwrap();

        assert_eq!(resp.applied, vec!["good".to_string()]);
        assert_eq!(resp.rejected.len(), 1);
        assert!(log.get("good").unwrap().replicated);
        assert!(log.get("bad").is_none());
        assert!(remote.ping().await);
    }

    #[tokio::test]
    async fn test_log_remote_store_keeps_photos() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(LocalLog::open(&tmp.path().join("log")).unwrap());
        let bare = LogRemoteStore::new(Arc::clone(&log));
        assert!(matches!(
            bare.put_blob("a", b"jpeg".to_vec()).await,
            Err(RemoteError::Rejected(_))
        ));

        let blobs: Arc<dyn BlobStore> =
            Arc::new(shutterbox::LocalBlobStore::new(tmp.path().join("blobs")));
        let remote = bare.with_blobs(Arc::clone(&blobs));
        let url = remote.put_blob("a", b"jpeg".to_vec()).await.unwrap();
        assert_eq!(url, "/uploads/a.jpg");
        assert_eq!(blobs.read("a").unwrap().unwrap(), b"jpeg");

        assert!(matches!(
            remote.put_blob("../escape", b"x".to_vec()).await,
            Err(RemoteError::Rejected(_))
        ));
    }
}
