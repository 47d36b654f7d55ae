use crate::scheduler::{BackoffPolicy, Intervals};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Replication and scheduling settings for one node.
///
/// Loaded from `{data_dir}/replication.json` when present, otherwise from
/// `SHUTTERBOX_*` environment variables. A node without `remote_url` runs
/// standalone: captures are stored and reaped but never shipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub node_id: String,
    pub remote_url: Option<String>,
    pub batch_size: usize,
    pub success_interval_secs: u64,
    pub drain_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Wall-clock budget for one batch attempt.
    pub attempt_timeout_secs: u64,
    /// Per-request timeout of the HTTP remote client.
    pub remote_timeout_secs: u64,
    /// Remote rejections before a record is dead-lettered; 0 never does.
    pub dead_letter_after: u32,
    pub delete_blob_after_sync: bool,
    pub sync_lock_ttl_secs: u64,
    pub reap_lock_ttl_secs: u64,
    pub sms_url: Option<String>,
    pub sms_sender: Option<String>,
    /// Base of the download link sent by SMS.
    pub public_url: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            node_id: default_node_id(),
            remote_url: None,
            batch_size: 10,
            success_interval_secs: 30,
            drain_interval_secs: 2,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            attempt_timeout_secs: 300,
            remote_timeout_secs: 10,
            dead_letter_after: 5,
            delete_blob_after_sync: false,
            sync_lock_ttl_secs: 600,
            reap_lock_ttl_secs: 43_200,
            sms_url: None,
            sms_sender: None,
            public_url: None,
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ReplicationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        ReplicationConfig {
            node_id: env_string("SHUTTERBOX_NODE_ID").unwrap_or(d.node_id),
            remote_url: env_string("SHUTTERBOX_REMOTE_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            batch_size: env_parse("SHUTTERBOX_BATCH_SIZE").unwrap_or(d.batch_size),
            success_interval_secs: env_parse("SHUTTERBOX_SUCCESS_INTERVAL_SECS")
                .unwrap_or(d.success_interval_secs),
            drain_interval_secs: env_parse("SHUTTERBOX_DRAIN_INTERVAL_SECS")
                .unwrap_or(d.drain_interval_secs),
            backoff_base_secs: env_parse("SHUTTERBOX_BACKOFF_BASE_SECS")
                .unwrap_or(d.backoff_base_secs),
            backoff_cap_secs: env_parse("SHUTTERBOX_BACKOFF_CAP_SECS")
                .unwrap_or(d.backoff_cap_secs),
            attempt_timeout_secs: env_parse("SHUTTERBOX_ATTEMPT_TIMEOUT_SECS")
                .unwrap_or(d.attempt_timeout_secs),
            remote_timeout_secs: env_parse("SHUTTERBOX_REMOTE_TIMEOUT_SECS")
                .unwrap_or(d.remote_timeout_secs),
            dead_letter_after: env_parse("SHUTTERBOX_DEAD_LETTER_AFTER")
                .unwrap_or(d.dead_letter_after),
            delete_blob_after_sync: env_parse("SHUTTERBOX_DELETE_BLOB_AFTER_SYNC")
                .unwrap_or(d.delete_blob_after_sync),
            sync_lock_ttl_secs: env_parse("SHUTTERBOX_SYNC_LOCK_TTL_SECS")
                .unwrap_or(d.sync_lock_ttl_secs),
            reap_lock_ttl_secs: env_parse("SHUTTERBOX_REAP_LOCK_TTL_SECS")
                .unwrap_or(d.reap_lock_ttl_secs),
            sms_url: env_string("SHUTTERBOX_SMS_URL"),
            sms_sender: env_string("SHUTTERBOX_SMS_SENDER"),
            public_url: env_string("SHUTTERBOX_PUBLIC_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Load from {data_dir}/replication.json, falling back to the environment
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join("replication.json");

        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<ReplicationConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded replication config: node_id={}, remote={}",
                            config.node_id,
                            config.remote_url.as_deref().unwrap_or("none")
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse replication.json: {}, using env", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read replication.json: {}, using env", e);
                }
            }
        }

        let config = Self::from_env();
        if config.remote_url.is_none() {
            tracing::info!(
                "No remote configured, running standalone: node_id={}",
                config.node_id
            );
        }
        config
    }

    /// Defaults pointed at `remote_url` with a fixed node id.
    pub fn for_tests(remote_url: Option<&str>) -> Self {
        ReplicationConfig {
            node_id: "test-node".to_string(),
            remote_url: remote_url.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.remote_url.is_some()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }

    pub fn intervals(&self) -> Intervals {
        Intervals {
            success: Duration::from_secs(self.success_interval_secs),
            drain: Duration::from_secs(self.drain_interval_secs),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    pub fn sync_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.sync_lock_ttl_secs.max(1))
    }

    pub fn reap_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.reap_lock_ttl_secs.max(1))
    }
}
