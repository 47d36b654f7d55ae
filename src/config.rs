use std::path::{Path, PathBuf};

/// Configuration for the local store and the retention reaper, loaded from
/// environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory for the record log and lock files.
    pub data_dir: PathBuf,
    /// Where captured blobs are written.
    pub blob_dir: PathBuf,
    /// Records older than this many days are purged regardless of replication state.
    pub retention_days: u32,
    /// Records deleted per reaper commit.
    pub reap_page_size: usize,
    /// Seconds between reaper runs.
    pub reap_interval_secs: u64,
    /// Superseded log lines tolerated before the log is rewritten.
    pub compact_threshold: u64,
}

impl StoreConfig {
    /// Load config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let data_dir =
            std::env::var("SHUTTERBOX_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let blob_dir = std::env::var("SHUTTERBOX_BLOB_DIR")
            .unwrap_or_else(|_| format!("{}/blobs", data_dir));

        Self {
            data_dir: PathBuf::from(data_dir),
            blob_dir: PathBuf::from(blob_dir),
            retention_days: env_parse("SHUTTERBOX_RETENTION_DAYS").unwrap_or(30),
            reap_page_size: env_parse("SHUTTERBOX_REAP_PAGE_SIZE").unwrap_or(200),
            reap_interval_secs: env_parse("SHUTTERBOX_REAP_INTERVAL_SECS").unwrap_or(86_400),
            compact_threshold: env_parse("SHUTTERBOX_COMPACT_THRESHOLD").unwrap_or(10_000),
        }
    }

    /// Defaults rooted at `data_dir` (for tests and embedding).
    pub fn for_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            blob_dir: data_dir.join("blobs"),
            retention_days: 30,
            reap_page_size: 200,
            reap_interval_secs: 86_400,
            compact_threshold: 10_000,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn retention_policy(&self) -> crate::reaper::RetentionPolicy {
        crate::reaper::RetentionPolicy {
            horizon: chrono::Duration::days(self.retention_days as i64),
            page_size: self.reap_page_size.max(1),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
