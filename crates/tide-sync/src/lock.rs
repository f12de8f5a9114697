//! # Lock Registry
//!
//! Typed mutual exclusion for sync activities on one database.
//!
//! ```text
//! LockKey { database: DatabaseId("/data/app.db"), purpose: Connect } ──► Mutex
//! LockKey { database: DatabaseId("/data/app.db"), purpose: Upload  } ──► Mutex
//! LockKey { database: DatabaseId("/data/other.db"), purpose: Connect } ──► Mutex
//! ```
//!
//! The registry covers one process. When several processes open the same
//! file, [`SharedStorageLock`] adds an exclusive OS file lock beside it.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Identity of a local database: its canonical file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId(PathBuf);

impl DatabaseId {
    pub fn from_path(path: &Path) -> Self {
        DatabaseId(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockPurpose {
    /// One connect sequence at a time.
    Connect,
    /// One upload loop iteration at a time.
    Upload,
    /// One active streaming sync.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub database: DatabaseId,
    pub purpose: LockPurpose,
}

impl LockKey {
    pub fn new(database: DatabaseId, purpose: LockPurpose) -> Self {
        LockKey { database, purpose }
    }
}

/// Process-wide table of async mutexes. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for the lock. Released when the guard is dropped.
    pub async fn acquire(&self, key: &LockKey) -> OwnedMutexGuard<()> {
        debug!(purpose = ?key.purpose, "Acquiring lock");
        self.mutex(key).lock_owned().await
    }

    /// Takes the lock only if it is free.
    pub fn try_acquire(&self, key: &LockKey) -> Option<OwnedMutexGuard<()>> {
        self.mutex(key).try_lock_owned().ok()
    }
}

// =============================================================================
// Cross-process Lock
// =============================================================================

/// Exclusive file lock at `<db>.sync.lock`, released on drop.
#[derive(Debug)]
pub struct SharedStorageLock {
    file: File,
    path: PathBuf,
}

impl SharedStorageLock {
    pub fn lock_path(database: &Path) -> PathBuf {
        let mut name = database.as_os_str().to_owned();
        name.push(".sync.lock");
        PathBuf::from(name)
    }

    /// Waits until the lock is held or `cancel` fires.
    ///
    /// Another process may hold the file for as long as it likes, so this
    /// polls with backoff instead of parking a blocking thread.
    pub async fn acquire(database: &Path, cancel: &CancellationToken) -> SyncResult<Self> {
        let path = Self::lock_path(database);
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if let Some(file) = Self::try_lock(&path)? {
                info!(path = %path.display(), "Shared storage lock acquired");
                return Ok(SharedStorageLock { file, path });
            }
            let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
            debug!(path = %path.display(), ?wait, "Shared storage lock held elsewhere");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::ShuttingDown),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fails with `LockUnavailable` instead of waiting.
    pub fn try_acquire(database: &Path) -> SyncResult<Self> {
        let path = Self::lock_path(database);
        match Self::try_lock(&path)? {
            Some(file) => Ok(SharedStorageLock { file, path }),
            None => Err(SyncError::LockUnavailable(format!("{} is held", path.display()))),
        }
    }

    /// `None` while another holder has the file locked.
    fn try_lock(path: &Path) -> SyncResult<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SyncError::LockUnavailable(format!("{}: {}", path.display(), e)))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(SyncError::LockUnavailable(format!("{}: {}", path.display(), e))),
        }
    }
}

impl Drop for SharedStorageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Shared storage lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_serializes_same_key() {
        let registry = LockRegistry::new();
        let db = DatabaseId::from_path(Path::new("/tmp/a.db"));
        let connect = LockKey::new(db.clone(), LockPurpose::Connect);

        let guard = registry.acquire(&connect).await;
        assert!(registry.try_acquire(&connect).is_none());
        // Other purposes and databases are independent.
        assert!(registry.try_acquire(&LockKey::new(db, LockPurpose::Upload)).is_some());
        let other = DatabaseId::from_path(Path::new("/tmp/b.db"));
        assert!(registry.try_acquire(&LockKey::new(other, LockPurpose::Connect)).is_some());

        drop(guard);
        assert!(registry.try_acquire(&connect).is_some());
    }

    #[tokio::test]
    async fn test_shared_storage_lock_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");

        let held = SharedStorageLock::acquire(&db, &CancellationToken::new())
            .await
            .unwrap();
        assert!(SharedStorageLock::lock_path(&db).exists());
        assert!(matches!(
            SharedStorageLock::try_acquire(&db),
            Err(SyncError::LockUnavailable(_))
        ));

        drop(held);
        assert!(SharedStorageLock::try_acquire(&db).is_ok());
    }

    #[tokio::test]
    async fn test_shared_storage_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let held = SharedStorageLock::try_acquire(&db).unwrap();

        let waiter = {
            let db = db.clone();
            tokio::spawn(async move { SharedStorageLock::acquire(&db, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let lock = tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .expect("acquired after release")
            .unwrap();
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn test_shared_storage_lock_wait_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let _held = SharedStorageLock::try_acquire(&db).unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let db = db.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { SharedStorageLock::acquire(&db, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait ended on cancel")
            .unwrap();
        assert!(matches!(result, Err(SyncError::ShuttingDown)));
    }
}
