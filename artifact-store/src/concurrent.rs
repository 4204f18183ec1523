//! Locking decorator.
//!
//! Serialises the write paths (`create`, `delete`, `update_meta`, and
//! `move_artifact` on the destination hash) per hash through the
//! [`LockManager`]. Reads and metadata reads pass straight through; they
//! tolerate concurrent writers by virtue of the inner store's
//! append/rename discipline.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::{
    ArtifactMeta, ArtifactReference, ArtifactStore, BlobReader, ByteRange, LockManager,
    MovableStore, Reader, StoreError,
};

#[derive(Debug)]
pub struct ConcurrentStore<S> {
    inner: S,
    locks: LockManager,
}

impl<S: ArtifactStore> ConcurrentStore<S> {
    pub fn new(
        inner: S,
        lock_dir: impl Into<Utf8PathBuf>,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if lock_timeout.is_zero() {
            return Err(StoreError::InvalidConfig(
                "lockTimeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            inner,
            locks: LockManager::new(lock_dir, lock_timeout)?,
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<S: ArtifactStore> ArtifactStore for ConcurrentStore<S> {
    fn alias(&self) -> &str {
        self.inner.alias()
    }

    async fn create(
        &self,
        hash: &str,
        reader: &mut Reader<'_>,
        size: i64,
        meta: Option<ArtifactMeta>,
    ) -> Result<ArtifactMeta, StoreError> {
        let _guard = self.locks.acquire(hash).await?;
        self.inner.create(hash, reader, size, meta).await
    }

    async fn read(
        &self,
        hash: &str,
        range: ByteRange,
    ) -> Result<(BlobReader, ByteRange), StoreError> {
        self.inner.read(hash, range).await
    }

    async fn update(
        &self,
        hash: &str,
        range: ByteRange,
        reader: &mut Reader<'_>,
    ) -> Result<(), StoreError> {
        self.inner.update(hash, range, reader).await
    }

    async fn delete(
        &self,
        hash: &str,
        reference: &ArtifactReference,
    ) -> Result<Option<ArtifactMeta>, StoreError> {
        let _guard = self.locks.acquire(hash).await?;
        self.inner.delete(hash, reference).await
    }

    async fn get_meta(&self, hash: &str) -> Result<ArtifactMeta, StoreError> {
        self.inner.get_meta(hash).await
    }

    async fn update_meta(&self, meta: ArtifactMeta) -> Result<ArtifactMeta, StoreError> {
        let _guard = self.locks.acquire(&meta.hash).await?;
        self.inner.update_meta(meta).await
    }
}

#[async_trait::async_trait]
impl<S: MovableStore> MovableStore for ConcurrentStore<S> {
    async fn move_artifact(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        // Lock the destination; the source is a private temp key.
        let _guard = self.locks.acquire(dst).await?;
        self.inner.move_artifact(src, dst).await
    }
}
