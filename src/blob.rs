use crate::error::{Result, ShutterboxError};
use crate::types::{PayloadRef, RecordId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const BLOB_EXT: &str = "jpg";

/// File name a blob is stored under, on kiosks and on the central store.
pub fn blob_file_name(id: &str) -> String {
    format!("{}.{}", id, BLOB_EXT)
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(&['/', '\\'][..]) || id.starts_with('.') {
        return Err(ShutterboxError::InvalidRecord(format!(
            "unsafe blob id {:?}",
            id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDeletion {
    Deleted,
    NotFound,
}

/// Storage for the artifact captured with a record.
pub trait BlobStore: Send + Sync {
    /// Store the bytes locally. The returned reference has no remote
    /// pointer yet; that is only set once a remote acknowledges a copy.
    fn put(&self, id: &str, bytes: &[u8]) -> Result<PayloadRef>;

    /// Bytes stored for `id`, or `None` if there are none.
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, payload: &PayloadRef) -> Result<BlobDeletion>;

    /// Remove blobs older than `cutoff` that no live record points at.
    fn sweep_orphans(&self, live: &HashSet<RecordId>, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Blobs as `{root}/{id}.jpg` on the local filesystem.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(blob_file_name(id))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, id: &str, bytes: &[u8]) -> Result<PayloadRef> {
        check_id(id)?;
        std::fs::create_dir_all(&self.root).map_err(ShutterboxError::storage)?;

        let path = self.path_for(id);
        let tmp = self.root.join(format!(".{}.{}.tmp", id, BLOB_EXT));
        std::fs::write(&tmp, bytes)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                ShutterboxError::storage(e)
            })?;

        Ok(PayloadRef {
            local_path: Some(path),
            remote_url: None,
        })
    }

    fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        check_id(id)?;
        match std::fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, payload: &PayloadRef) -> Result<BlobDeletion> {
        let Some(path) = payload.local_path.as_ref() else {
            return Ok(BlobDeletion::NotFound);
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(BlobDeletion::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobDeletion::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn sweep_orphans(&self, live: &HashSet<RecordId>, cutoff: DateTime<Utc>) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let orphaned = match name.strip_suffix(&format!(".{}", BLOB_EXT)) {
                Some(id) => !live.contains(id),
                // Leftover temp files from an interrupted put.
                None => name.ends_with(".tmp"),
            };
            if !orphaned {
                continue;
            }

            let modified: Option<DateTime<Utc>> = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            if !matches!(modified, Some(m) if m < cutoff) {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!("[REAP] removed orphaned blob {}", path.display());
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "[REAP] failed to remove orphaned blob {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path().join("blobs"));

        let payload = store.put("abc", b"jpeg-bytes").unwrap();
        let path = payload.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
        assert!(payload.remote_url.is_none());
        assert_eq!(store.read("abc").unwrap().unwrap(), b"jpeg-bytes");

        assert_eq!(store.delete(&payload).unwrap(), BlobDeletion::Deleted);
        assert_eq!(store.delete(&payload).unwrap(), BlobDeletion::NotFound);
        assert!(store.read("abc").unwrap().is_none());
        assert_eq!(
            store.delete(&PayloadRef::default()).unwrap(),
            BlobDeletion::NotFound
        );
    }

    #[test]
    fn test_put_rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path());
        assert!(store.put("../etc/passwd", b"x").is_err());
        assert!(store.put(".hidden", b"x").is_err());
        assert!(store.read("../etc/passwd").is_err());
    }

    #[test]
    fn test_sweep_orphans_keeps_live_and_recent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path());
        store.put("live", b"1").unwrap();
        store.put("orphan", b"2").unwrap();

        let live: HashSet<RecordId> = ["live".to_string()].into_iter().collect();

        // Nothing is older than a cutoff in the past.
        let past = Utc::now() - chrono::Duration::days(1);
        assert_eq!(store.sweep_orphans(&live, past).unwrap(), 0);

        let future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(store.sweep_orphans(&live, future).unwrap(), 1);
        assert!(store.path_for("live").exists());
        assert!(!store.path_for("orphan").exists());
    }

    #[test]
    fn test_sweep_missing_root() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path().join("nope"));
        assert_eq!(store.sweep_orphans(&HashSet::new(), Utc::now()).unwrap(), 0);
    }
}
