//! Retention reaper: purges records older than the retention horizon along
//! with their blobs, whether or not they were ever replicated.

use crate::blob::{BlobDeletion, BlobStore};
use crate::error::Result;
use crate::log::LocalLog;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub horizon: chrono::Duration,
    /// Records removed per log commit.
    pub page_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            horizon: chrono::Duration::days(30),
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub records_removed: usize,
    /// Includes records whose unreplicated state expired with them.
    pub unreplicated_removed: usize,
    pub blobs_removed: usize,
    pub blob_failures: usize,
    pub orphans_removed: usize,
    pub pages: usize,
}

/// Delete every record created before `now - horizon`, one page per commit.
///
/// Within a page the record deletion is committed first and the blobs are
/// removed afterwards, so a blob never disappears while its record can still
/// be read as unreplicated. Blob failures are counted and logged; they never
/// stop the record purge.
pub fn reap_expired(
    log: &LocalLog,
    blobs: &dyn BlobStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<ReapReport> {
    let cutoff = now - policy.horizon;
    let page_size = policy.page_size.max(1);
    let mut report = ReapReport::default();

    loop {
        let page = log.list_expired(cutoff, page_size);
        if page.is_empty() {
            break;
        }

        let ids: Vec<_> = page.iter().map(|r| r.id.clone()).collect();
        let removed = log.delete_many(&ids)?;
        report.pages += 1;
        report.records_removed += removed;
        report.unreplicated_removed += page.iter().filter(|r| !r.replicated).count();

        for record in &page {
            if record.payload_ref.local_path.is_none() {
                continue;
            }
            match blobs.delete(&record.payload_ref) {
                Ok(BlobDeletion::Deleted) => report.blobs_removed += 1,
                Ok(BlobDeletion::NotFound) => {}
                Err(e) => {
                    report.blob_failures += 1;
                    tracing::warn!("[REAP] failed to delete blob for {}: {}", record.id, e);
                }
            }
        }

        tracing::debug!(
            "[REAP] page {}: removed {} records",
            report.pages,
            removed
        );

        if removed == 0 {
            // Nothing the log would delete; avoid spinning on the same page.
            break;
        }
    }

    match blobs.sweep_orphans(&log.live_ids(), cutoff) {
        Ok(n) => report.orphans_removed = n,
        Err(e) => tracing::warn!("[REAP] orphan sweep failed: {}", e),
    }

    if let Err(e) = log.maybe_compact() {
        tracing::warn!("[REAP] log compaction failed: {}", e);
    }

    Ok(report)
}

/// One scheduled reaper run. Errors are logged and absorbed: whatever is left
/// is picked up by the next run.
pub fn run_reap(log: &LocalLog, blobs: &dyn BlobStore, policy: &RetentionPolicy) -> ReapReport {
    match reap_expired(log, blobs, policy, Utc::now()) {
        Ok(report) => {
            if report.records_removed > 0 || report.orphans_removed > 0 {
                tracing::info!(
                    "[REAP] removed {} records ({} never replicated), {} blobs, {} orphans",
                    report.records_removed,
                    report.unreplicated_removed,
                    report.blobs_removed,
                    report.orphans_removed
                );
            }
            report
        }
        Err(e) => {
            tracing::warn!("[REAP] run aborted: {}", e);
            ReapReport::default()
        }
    }
}
