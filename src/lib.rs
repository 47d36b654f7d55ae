//! # Shutterbox
//!
//! Store-and-forward storage for capture kiosks. Records are written to a
//! durable local log first and shipped to a central store later by the
//! companion `shutterbox-replication` crate, so a capture never waits on the
//! network.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shutterbox::{LocalLog, Record};
//!
//! # fn main() -> shutterbox::Result<()> {
//! let log = LocalLog::open(std::path::Path::new("./data/log"))?;
//! let id = log.append(Record::new())?;
//!
//! let pending = log.list_unreplicated(10);
//! assert_eq!(pending[0].id, id);
//!
//! log.mark_replicated(&id)?;
//! assert_eq!(log.count_unreplicated(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Dependencies | Use case |
//! |---------|-------------|----------|
//! | `axum-support` | axum | [`ShutterboxError`] implements `IntoResponse` |

pub mod blob;
pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod reaper;
pub mod types;

pub use blob::{blob_file_name, BlobDeletion, BlobStore, LocalBlobStore};
pub use config::StoreConfig;
pub use error::{Result, ShutterboxError};
pub use lock::{FileLockStore, LockStore, MemoryLockStore};
pub use log::LocalLog;
pub use reaper::{ReapReport, RetentionPolicy};
pub use types::*;
