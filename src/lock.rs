//! Scheduling lock: a keyed token with a TTL, taken via atomic
//! set-if-absent so only one process seeds each periodic job.
//!
//! A `false` from [`LockStore::acquire`] is the expected outcome when
//! another live holder exists; it is not an error.

use crate::error::{Result, ShutterboxError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub trait LockStore: Send + Sync {
    /// Set `key` if absent (or expired) with the given expiry. True when
    /// this holder now owns the key.
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Extend a key this holder still owns. False if it was lost.
    fn renew(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Drop the key if this holder owns it.
    fn release(&self, key: &str) -> Result<()>;

    fn holder(&self) -> &str;
}

fn new_holder_token() -> String {
    format!("holder-{}", uuid::Uuid::new_v4())
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl LockEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Process-local lock table. Clones made with [`MemoryLockStore::handle`]
/// share the table but hold distinct tokens, which is how tests stand in
/// for separate processes.
#[derive(Clone)]
pub struct MemoryLockStore {
    locks: Arc<DashMap<String, LockEntry>>,
    holder: String,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        MemoryLockStore {
            locks: Arc::new(DashMap::new()),
            holder: new_holder_token(),
        }
    }

    pub fn handle(&self) -> Self {
        MemoryLockStore {
            locks: Arc::clone(&self.locks),
            holder: new_holder_token(),
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStore for MemoryLockStore {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let fresh = LockEntry {
            holder: self.holder.clone(),
            expires_at: expiry(ttl),
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_live(now) && e.get().holder != self.holder {
                    return Ok(false);
                }
                e.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(v) => {
                v.insert(fresh);
                Ok(true)
            }
        }
    }

    fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.locks.get_mut(key) {
            Some(mut e) if e.holder == self.holder => {
                e.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str) -> Result<()> {
        self.locks.remove_if(key, |_, e| e.holder == self.holder);
        Ok(())
    }

    fn holder(&self) -> &str {
        &self.holder
    }
}

/// Locks shared by every process on the host through a coordination
/// directory. Check-and-set runs under an exclusive `flock` on a guard file,
/// which is what makes set-if-absent atomic across processes.
pub struct FileLockStore {
    dir: PathBuf,
    holder: String,
}

impl FileLockStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(FileLockStore {
            dir: dir.to_path_buf(),
            holder: new_holder_token(),
        })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ShutterboxError::Config(format!(
                "invalid lock key {:?}",
                key
            )));
        }
        Ok(self.dir.join(format!("{}.lock", key)))
    }

    /// Run `f` with the directory guard held.
    fn with_guard<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.dir.join(".guard"))?;
        FileExt::lock_exclusive(&guard)?;
        let out = f();
        if let Err(e) = FileExt::unlock(&guard) {
            tracing::warn!("[LOCK] failed to unlock guard: {}", e);
        }
        out
    }

    fn read_entry(path: &Path) -> Option<LockEntry> {
        let raw = fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_entry(path: &Path, entry: &LockEntry) -> Result<()> {
        let tmp = path.with_extension("lock.tmp");
        fs::write(&tmp, serde_json::to_vec(entry)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl LockStore for FileLockStore {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let path = self.key_path(key)?;
        self.with_guard(|| {
            let now = Utc::now();
            if let Some(existing) = Self::read_entry(&path) {
                if existing.is_live(now) && existing.holder != self.holder {
                    return Ok(false);
                }
            }
            Self::write_entry(
                &path,
                &LockEntry {
                    holder: self.holder.clone(),
                    expires_at: expiry(ttl),
                },
            )?;
            Ok(true)
        })
    }

    fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        let path = self.key_path(key)?;
        self.with_guard(|| match Self::read_entry(&path) {
            Some(existing) if existing.holder == self.holder => {
                Self::write_entry(
                    &path,
                    &LockEntry {
                        holder: self.holder.clone(),
                        expires_at: expiry(ttl),
                    },
                )?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn release(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        self.with_guard(|| {
            if let Some(existing) = Self::read_entry(&path) {
                if existing.holder == self.holder {
                    fs::remove_file(&path)?;
                }
            }
            Ok(())
        })
    }

    fn holder(&self) -> &str {
        &self.holder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEN_MIN: Duration = Duration::from_secs(600);

    #[test]
    fn test_memory_second_holder_is_refused() {
        let a = MemoryLockStore::new();
        let b = a.handle();

        assert!(a.acquire("sync-lock", TEN_MIN).unwrap());
        assert!(!b.acquire("sync-lock", TEN_MIN).unwrap());
        // Re-acquire by the owner is fine.
        assert!(a.acquire("sync-lock", TEN_MIN).unwrap());
        // Independent keys do not contend.
        assert!(b.acquire("reap-lock", TEN_MIN).unwrap());
    }

    #[test]
    fn test_memory_expiry_frees_key() {
        let a = MemoryLockStore::new();
        let b = a.handle();

        assert!(a.acquire("k", Duration::from_millis(20)).unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.acquire("k", TEN_MIN).unwrap());
        assert!(!a.renew("k", TEN_MIN).unwrap());
    }

    #[test]
    fn test_memory_release_only_by_owner() {
        let a = MemoryLockStore::new();
        let b = a.handle();

        assert!(a.acquire("k", TEN_MIN).unwrap());
        b.release("k").unwrap();
        assert!(!b.acquire("k", TEN_MIN).unwrap());
        a.release("k").unwrap();
        assert!(b.acquire("k", TEN_MIN).unwrap());
    }

    #[test]
    fn test_file_lock_across_instances() {
        let tmp = TempDir::new().unwrap();
        let first = FileLockStore::open(tmp.path()).unwrap();
        let second = FileLockStore::open(tmp.path()).unwrap();

        assert!(first.acquire("sync-lock", TEN_MIN).unwrap());
        assert!(!second.acquire("sync-lock", TEN_MIN).unwrap());
        assert!(first.renew("sync-lock", TEN_MIN).unwrap());
        assert!(!second.renew("sync-lock", TEN_MIN).unwrap());

        first.release("sync-lock").unwrap();
        assert!(second.acquire("sync-lock", TEN_MIN).unwrap());
    }

    #[test]
    fn test_file_lock_expired_entry_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let first = FileLockStore::open(tmp.path()).unwrap();
        let second = FileLockStore::open(tmp.path()).unwrap();

        assert!(first.acquire("reap-lock", Duration::from_millis(20)).unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(second.acquire("reap-lock", TEN_MIN).unwrap());
        assert!(!first.acquire("reap-lock", TEN_MIN).unwrap());
    }

    #[test]
    fn test_file_lock_rejects_bad_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FileLockStore::open(tmp.path()).unwrap();
        assert!(store.acquire("../escape", TEN_MIN).is_err());
        assert!(store.acquire("", TEN_MIN).is_err());
    }
}
