//! One replication attempt: pull the oldest pending batch, push it to the
//! remote, and commit the outcome locally.
//!
//! The remote commit always precedes the local one. Only ids the remote
//! reports as applied are marked replicated, and they are marked together
//! in a single log commit, so a failed or timed-out attempt leaves every
//! record of the batch unreplicated.

use crate::config::ReplicationConfig;
use crate::notify::Notifier;
use crate::remote::{RemoteError, RemoteStore};
use crate::types::{BatchOutcome, UpsertBatchResponse};
use shutterbox::{
    BlobStore, FailureKind, LocalLog, Record, RecordFailure, RecordId, ShutterboxError,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub node_id: String,
    pub batch_size: usize,
    pub attempt_timeout: Duration,
    pub dead_letter_after: u32,
    pub delete_blob_after_sync: bool,
}

impl From<&ReplicationConfig> for WorkerSettings {
    fn from(config: &ReplicationConfig) -> Self {
        WorkerSettings {
            node_id: config.node_id.clone(),
            batch_size: config.batch_size.max(1),
            attempt_timeout: config.attempt_timeout(),
            dead_letter_after: config.dead_letter_after,
            delete_blob_after_sync: config.delete_blob_after_sync,
        }
    }
}

pub struct ReplicationWorker {
    log: Arc<LocalLog>,
    remote: Arc<dyn RemoteStore>,
    notifier: Arc<dyn Notifier>,
    blobs: Arc<dyn BlobStore>,
    settings: WorkerSettings,
}

/// What one attempt sent and what came back.
struct Pushed {
    batch: Vec<Record>,
    /// Records held back because the remote refused their photo.
    blob_rejections: Vec<RecordFailure>,
    result: Result<UpsertBatchResponse, RemoteError>,
}

impl ReplicationWorker {
    pub fn new(
        log: Arc<LocalLog>,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
        blobs: Arc<dyn BlobStore>,
        settings: WorkerSettings,
    ) -> Self {
        ReplicationWorker {
            log,
            remote,
            notifier,
            blobs,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Run one attempt. Never retries internally and never errors: every
    /// failure comes back as [`BatchOutcome::Failed`] carrying `attempt`.
    pub async fn run_batch(&self, attempt: u32) -> BatchOutcome {
        let budget = self.settings.attempt_timeout;
        let pushed = match tokio::time::timeout(budget, self.push()).await {
            Err(_) => {
                let err = ShutterboxError::Timeout(budget.as_secs());
                tracing::warn!(attempt, "[SYNC] {}, leaving batch pending", err);
                return BatchOutcome::Failed {
                    attempt,
                    reason: err.to_string(),
                };
            }
            Ok(None) => return BatchOutcome::Idle,
            Ok(Some(pushed)) => pushed,
        };

        let Pushed {
            batch,
            blob_rejections,
            result,
        } = pushed;
        match result {
            Ok(resp) => self.commit(batch, blob_rejections, resp, attempt).await,
            Err(e) => {
                tracing::warn!(attempt, "[SYNC] batch of {} failed: {}", batch.len(), e);
                let kind = if ShutterboxError::from(e.clone()).is_retryable() {
                    FailureKind::Unavailable
                } else {
                    FailureKind::Rejected
                };
                let mut failures: Vec<RecordFailure> = batch
                    .iter()
                    .map(|r| RecordFailure {
                        id: r.id.clone(),
                        kind,
                        reason: e.to_string(),
                    })
                    .collect();
                failures.extend(blob_rejections);
                self.record_failures(failures).await;
                BatchOutcome::Failed {
                    attempt,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn push(&self) -> Option<Pushed> {
        let pending = self.log.list_unreplicated(self.settings.batch_size);
        if pending.is_empty() {
            return None;
        }

        let mut batch = Vec::with_capacity(pending.len());
        let mut blob_rejections = Vec::new();
        for mut record in pending {
            match self.ship_blob(&record).await {
                Ok(Some(url)) => record.payload_ref.remote_url = Some(url),
                Ok(None) => {}
                Err(RemoteError::Rejected(reason)) => {
                    tracing::warn!("[SYNC] photo of {} refused: {}", record.id, reason);
                    blob_rejections.push(RecordFailure {
                        id: record.id.clone(),
                        kind: FailureKind::Rejected,
                        reason,
                    });
                    continue;
                }
                Err(e) => {
                    // The record and everything after it stay pending.
                    batch.push(record);
                    return Some(Pushed {
                        batch,
                        blob_rejections,
                        result: Err(e),
                    });
                }
            }
            batch.push(record);
        }

        let result = if batch.is_empty() {
            Ok(UpsertBatchResponse::default())
        } else {
            self.remote
                .upsert_batch(&self.settings.node_id, &batch)
                .await
        };
        Some(Pushed {
            batch,
            blob_rejections,
            result,
        })
    }

    /// Upload the photo of `record` if it has a local copy the remote has
    /// not acknowledged yet. `Ok(None)` means there is nothing to ship.
    async fn ship_blob(&self, record: &Record) -> Result<Option<String>, RemoteError> {
        if record.payload_ref.local_path.is_none() || record.payload_ref.remote_url.is_some() {
            return Ok(None);
        }
        let blobs = Arc::clone(&self.blobs);
        let id = record.id.clone();
        let read = tokio::task::spawn_blocking(move || blobs.read(&id))
            .await
            .map_err(|e| RemoteError::Unavailable(format!("blob read task failed: {}", e)))?;
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!("[SYNC] photo of {} is missing locally", record.id);
                return Ok(None);
            }
            Err(e) => return Err(RemoteError::Rejected(format!("photo unreadable: {}", e))),
        };
        self.remote.put_blob(&record.id, bytes).await.map(Some)
    }

    async fn commit(
        &self,
        batch: Vec<Record>,
        blob_rejections: Vec<RecordFailure>,
        resp: UpsertBatchResponse,
        attempt: u32,
    ) -> BatchOutcome {
        let in_batch: HashSet<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        let applied: Vec<RecordId> = resp
            .applied
            .into_iter()
            .filter(|id| in_batch.contains(id.as_str()))
            .collect();
        let applied_set: HashSet<&str> = applied.iter().map(String::as_str).collect();

        let mut failures: Vec<RecordFailure> = resp
            .rejected
            .iter()
            .filter(|r| in_batch.contains(r.id.as_str()) && !applied_set.contains(r.id.as_str()))
            .map(|r| RecordFailure {
                id: r.id.clone(),
                kind: FailureKind::Rejected,
                reason: r.reason.clone(),
            })
            .collect();
        let attempted = batch.len() + blob_rejections.len();
        failures.extend(blob_rejections);
        let rejected = failures.len();
        let reported: HashSet<String> = failures.iter().map(|f| f.id.clone()).collect();
        for record in &batch {
            if !applied_set.contains(record.id.as_str()) && !reported.contains(&record.id) {
                failures.push(RecordFailure {
                    id: record.id.clone(),
                    kind: FailureKind::Unavailable,
                    reason: "not acknowledged by remote".to_string(),
                });
            }
        }

        let remote_urls: BTreeMap<RecordId, String> = batch
            .iter()
            .filter(|r| applied_set.contains(r.id.as_str()))
            .filter_map(|r| {
                let url = r.payload_ref.remote_url.clone()?;
                Some((r.id.clone(), url))
            })
            .collect();
        let log = Arc::clone(&self.log);
        let to_mark = applied.clone();
        let marked = tokio::task::spawn_blocking(move || {
            log.mark_replicated_with_remote(&to_mark, &remote_urls)
        })
        .await;
        let flipped = match marked {
            Ok(Ok(flipped)) => flipped,
            Ok(Err(e)) => {
                tracing::error!(
                    attempt,
                    "[SYNC] remote applied batch but local commit failed: {}",
                    e
                );
                return BatchOutcome::Failed {
                    attempt,
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                tracing::error!(attempt, "[SYNC] local commit task failed: {}", e);
                return BatchOutcome::Failed {
                    attempt,
                    reason: format!("local commit task failed: {}", e),
                };
            }
        };

        if !failures.is_empty() {
            self.record_failures(failures).await;
        }

        if !flipped.is_empty() {
            self.after_commit(&batch, &flipped).await;
        }

        let remaining = self.log.count_unreplicated();
        tracing::info!(
            "[SYNC] replicated {} records ({} rejected, {} pending)",
            flipped.len(),
            rejected,
            remaining
        );

        // Nothing moved: back off instead of draining the same batch again.
        if applied.is_empty() {
            return BatchOutcome::Failed {
                attempt,
                reason: format!(
                    "remote applied none of {} records ({} rejected)",
                    attempted,
                    rejected
                ),
            };
        }
        BatchOutcome::Replicated {
            replicated: flipped.len(),
            rejected,
            remaining,
        }
    }
    /// Advisory bookkeeping; a failure here is logged and dropped.
    async fn record_failures(&self, failures: Vec<RecordFailure>) {
        let log = Arc::clone(&self.log);
        let threshold = self.settings.dead_letter_after;
        let recorded =
            tokio::task::spawn_blocking(move || log.record_failures(&failures, threshold)).await;
        match recorded {
            Ok(Ok(dead)) => {
                for id in dead {
                    tracing::warn!(
                        "[SYNC] record {} dead-lettered after repeated rejections",
                        id
                    );
                }
            }
            Ok(Err(e)) => tracing::warn!("[SYNC] failed to record attempt failures: {}", e),
            Err(e) => tracing::warn!("[SYNC] failure bookkeeping task failed: {}", e),
        }
    }

    /// Runs only once `replicated = true` is durable for `flipped`.
    async fn after_commit(&self, batch: &[Record], flipped: &[RecordId]) {
        let flipped: HashSet<&str> = flipped.iter().map(String::as_str).collect();
        let done: Vec<Record> = batch
            .iter()
            .filter(|r| flipped.contains(r.id.as_str()))
            .cloned()
            .collect();

        if self.settings.delete_blob_after_sync {
            let blobs = Arc::clone(&self.blobs);
            // Only photos the remote acknowledged; anything else is the last copy.
            let payloads: Vec<_> = done
                .iter()
                .filter(|r| {
                    r.payload_ref.local_path.is_some() && r.payload_ref.remote_url.is_some()
                })
                .map(|r| (r.id.clone(), r.payload_ref.clone()))
                .collect();
            let deleted = tokio::task::spawn_blocking(move || {
                for (id, payload) in payloads {
                    if let Err(e) = blobs.delete(&payload) {
                        tracing::warn!("[SYNC] failed to delete blob of {}: {}", id, e);
                    }
                }
            })
            .await;
            if let Err(e) = deleted {
                tracing::warn!("[SYNC] blob cleanup task failed: {}", e);
            }
        }

        for record in done.into_iter().filter(|r| r.contact.phone.is_some()) {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&record).await {
                    tracing::warn!("[NOTIFY] capture {}: {}", record.id, e);
                }
            });
        }
    }
}
