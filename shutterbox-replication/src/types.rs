use serde::{Deserialize, Serialize};
use shutterbox::{Record, RecordId};

/// Batch pushed from a kiosk to the central store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertBatchRequest {
    pub node_id: String,
    pub records: Vec<Record>,
}

/// Central store's verdict on a batch. `applied` records are durably
/// committed; `rejected` ones failed validation and were not written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertBatchResponse {
    pub applied: Vec<RecordId>,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
}

/// Central store's acknowledgement of a stored photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobUploadResponse {
    pub remote_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub id: RecordId,
    pub reason: String,
}

/// Result of one replication attempt, as reported to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Nothing was waiting.
    Idle,
    Replicated {
        replicated: usize,
        rejected: usize,
        /// Pending records left after this batch.
        remaining: usize,
    },
    Failed { attempt: u32, reason: String },
}

impl BatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed { .. })
    }
}

/// Replication status for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub node_id: String,
    pub replication_enabled: bool,
    pub remote_url: Option<String>,
    /// This process currently holds the replication schedule.
    pub sync_active: bool,
    pub reap_active: bool,
    pub sync: crate::scheduler::SchedulerSnapshot,
    pub reap: crate::scheduler::SchedulerSnapshot,
    pub unreplicated: usize,
    pub dead_lettered: usize,
    pub last_outcome: Option<BatchOutcome>,
}
