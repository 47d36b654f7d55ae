pub mod client;
pub mod config;
pub mod manager;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use config::ReplicationConfig;
pub use manager::{Collaborators, ReplicationManager};
pub use remote::{LogRemoteStore, MemoryRemoteStore, RemoteError, RemoteStore};
pub use types::{
    BatchOutcome, BlobUploadResponse, ReplicationStatus, UpsertBatchRequest, UpsertBatchResponse,
};
