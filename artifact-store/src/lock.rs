//! Cross-process per-hash advisory locks.
//!
//! Each hash maps to a lock file under the lock root using the same
//! sharded layout as the blob store (`L/H[0:2]/H[2:].lock`). Acquisition
//! is a retrying try-lock polled every 10 ms until the configured timeout
//! expires. The lock file contents are irrelevant; only the advisory lock
//! on it matters.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use fs4::fs_std::FileExt;
use tokio::time::Instant;

use crate::StoreError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct LockManager {
    root: Utf8PathBuf,
    timeout: Duration,
}

impl LockManager {
    /// Creates the manager, ensuring the lock root exists.
    pub fn new(root: impl Into<Utf8PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock_path(&self, hash: &str) -> Utf8PathBuf {
        if hash.len() < 2 || !hash.is_char_boundary(2) {
            return self.root.join(format!("{hash}.lock"));
        }
        self.root
            .join(&hash[..2])
            .join(format!("{}.lock", &hash[2..]))
    }

    /// Acquires the exclusive lock for `hash`, waiting up to the default
    /// timeout.
    pub async fn acquire(&self, hash: &str) -> Result<LockGuard, StoreError> {
        self.acquire_with_timeout(hash, self.timeout).await
    }

    /// Acquires the exclusive lock for `hash` with an explicit timeout,
    /// for callers carrying their own deadline.
    pub async fn acquire_with_timeout(
        &self,
        hash: &str,
        timeout: Duration,
    ) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file, path }),
                Err(e) if e.kind() == fs4::lock_contended_error().kind() => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                tracing::debug!(hash, ?timeout, "lock acquisition timed out");
                return Err(StoreError::LockTimeout {
                    hash: hash.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

/// An exclusive hold on a per-hash lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: std::fs::File,
    #[allow(dead_code)]
    path: Utf8PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout: Duration) -> (tempfile::TempDir, LockManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let manager = LockManager::new(root, timeout).unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn lock_files_use_sharded_layout() {
        let (_dir, manager) = manager(Duration::from_secs(1));
        let hash = "abcdef123456";
        let _guard = manager.acquire(hash).await.unwrap();
        assert!(manager.root.join("ab").join("cdef123456.lock").is_file());
    }

    #[tokio::test]
    async fn reacquire_after_release() {
        let (_dir, manager) = manager(Duration::from_millis(200));
        let guard = manager.acquire("aa11").await.unwrap();
        drop(guard);
        let _guard = manager.acquire("aa11").await.unwrap();
    }

    #[tokio::test]
    async fn distinct_hashes_do_not_contend() {
        let (_dir, manager) = manager(Duration::from_millis(200));
        let _a = manager.acquire("aa11").await.unwrap();
        let _b = manager.acquire("bb22").await.unwrap();
    }
}
