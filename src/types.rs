use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type RecordId = String;

/// Pointer to the blob captured alongside a record. At most one local and
/// one remote reference exist at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl PayloadRef {
    pub fn is_empty(&self) -> bool {
        self.local_path.is_none() && self.remote_url.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A captured artifact plus its replication bookkeeping.
///
/// `id`, `created_at` and the capture fields never change after
/// [`crate::LocalLog::append`]. Only the replication worker touches
/// `replicated`, `attempt_count`, `last_error`, `rejections` and
/// `dead_lettered`; only the reaper removes records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload_ref: PayloadRef,
    #[serde(default)]
    pub contact: Contact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub replicated: bool,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub rejections: u32,
    #[serde(default)]
    pub dead_lettered: bool,
}

impl Record {
    /// New unreplicated record with a fresh v4 id, stamped now.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<RecordId>) -> Self {
        Record {
            id: id.into(),
            created_at: Utc::now(),
            payload_ref: PayloadRef::default(),
            contact: Contact::default(),
            background_id: None,
            metadata: serde_json::Value::Null,
            replicated: false,
            attempt_count: 0,
            last_error: None,
            rejections: 0,
            dead_lettered: false,
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn payload(mut self, payload_ref: PayloadRef) -> Self {
        self.payload_ref = payload_ref;
        self
    }

    pub fn contact(mut self, contact: Contact) -> Self {
        self.contact = contact;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Eligible for the replication worker.
    pub fn is_pending(&self) -> bool {
        !self.replicated && !self.dead_lettered
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll view of a record's replication state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub replicated: bool,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered: bool,
}

impl From<&Record> for RecordStatus {
    fn from(r: &Record) -> Self {
        RecordStatus {
            id: r.id.clone(),
            created_at: r.created_at,
            replicated: r.replicated,
            attempt_count: r.attempt_count,
            last_error: r.last_error.clone(),
            dead_lettered: r.dead_lettered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or remote store down. Never dead-letters.
    Unavailable,
    /// Remote refused this specific record.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub id: RecordId,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub total: usize,
    pub unreplicated: usize,
    pub replicated: usize,
    pub dead_lettered: usize,
    pub segments: usize,
    pub dead_lines: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_pending() {
        let r = Record::new();
        assert!(!r.id.is_empty());
        assert!(r.is_pending());
        assert_eq!(r.attempt_count, 0);
        assert!(r.last_error.is_none());
    }

    #[test]
    fn test_record_deserializes_with_missing_bookkeeping() {
        let r: Record = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "created_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(r.id, "abc");
        assert!(!r.replicated);
        assert!(r.payload_ref.is_empty());
    }

    #[test]
    fn test_status_view() {
        let mut r = Record::with_id("x");
        r.attempt_count = 3;
        r.last_error = Some("timeout".into());
        let s = RecordStatus::from(&r);
        assert_eq!(s.id, "x");
        assert_eq!(s.attempt_count, 3);
        assert_eq!(s.last_error.as_deref(), Some("timeout"));
        assert!(!s.replicated);
    }
}
