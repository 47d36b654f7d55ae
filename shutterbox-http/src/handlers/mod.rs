use crate::server::ServeMode;
use shutterbox::{BlobStore, LocalLog};
use shutterbox_replication::{LogRemoteStore, ReplicationManager};
use std::sync::Arc;

pub mod captures;
pub mod health;
pub mod internal;
pub mod uploads;

pub use captures::{capture_status, create_capture, retry_capture};
pub use health::health;
pub use uploads::serve_upload;

pub struct AppState {
    pub node_id: String,
    pub mode: ServeMode,
    pub log: Arc<LocalLog>,
    pub blobs: Arc<dyn BlobStore>,
    /// Present on kiosks; drives replication and reaping.
    pub replication_manager: Option<Arc<ReplicationManager>>,
    /// Present on the central store; receives kiosk batches.
    pub central: Option<LogRemoteStore>,
}
