//! Storage traits and stream aliases.

use std::fmt;

use tokio::io;

use crate::{ArtifactMeta, ArtifactReference, ByteRange, StoreError};

/// A reader stream supplying blob contents to the store.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A bounded reader stream over blob contents handed out by the store.
/// The underlying file handle stays valid across a concurrent delete
/// (blobs are renamed into trash, never unlinked in place).
pub type BlobReader = Box<dyn io::AsyncRead + Unpin + Send>;

/// Streaming CRUD over artifacts keyed by hash.
///
/// Artifacts are created and deleted *by reference*: creating an existing
/// hash merges references into its metadata, and a delete removes one
/// reference, trashing the blob only when the last one goes.
#[async_trait::async_trait]
pub trait ArtifactStore: fmt::Debug + Send + Sync {
    /// The alias this store was registered under.
    fn alias(&self) -> &str;

    /// Stores a new artifact, or merges references into an existing one.
    ///
    /// `size` is the expected byte length; `-1` means unknown. When the
    /// blob already exists a non-negative `size` must match the recorded
    /// length or the call fails with [`StoreError::HashConflict`]; the
    /// reader is not consumed and only metadata is rewritten.
    async fn create(
        &self,
        hash: &str,
        reader: &mut Reader<'_>,
        size: i64,
        meta: Option<ArtifactMeta>,
    ) -> Result<ArtifactMeta, StoreError>;

    /// Opens a bounded reader over `range`, clamped to the blob size.
    /// Returns the reader together with the range actually served.
    /// Reads never take locks.
    async fn read(&self, hash: &str, range: ByteRange)
        -> Result<(BlobReader, ByteRange), StoreError>;

    /// Writes `reader` into the blob at `range.offset`, zero-padding the
    /// gap when the offset lies past the end of the blob. Never shrinks
    /// the blob. Reserved for chunked-upload assembly.
    async fn update(
        &self,
        hash: &str,
        range: ByteRange,
        reader: &mut Reader<'_>,
    ) -> Result<(), StoreError>;

    /// Removes one reference. Returns the updated metadata while
    /// references remain, or `None` once the artifact has been moved to
    /// trash.
    async fn delete(
        &self,
        hash: &str,
        reference: &ArtifactReference,
    ) -> Result<Option<ArtifactMeta>, StoreError>;

    /// Reads the metadata for `hash`.
    async fn get_meta(&self, hash: &str) -> Result<ArtifactMeta, StoreError>;

    /// Overwrites the metadata for `meta.hash`, creating it if absent.
    async fn update_meta(&self, meta: ArtifactMeta) -> Result<ArtifactMeta, StoreError>;
}

/// The additional capability of relocating an artifact between hashes,
/// required by the hash-computing layer for temp-to-final promotion.
#[async_trait::async_trait]
pub trait MovableStore: ArtifactStore {
    /// Renames blob and metadata from `src` to `dst`, rewriting the
    /// metadata's hash field to follow the new key. Fails with
    /// [`StoreError::AlreadyExists`] when `dst` is occupied.
    async fn move_artifact(&self, src: &str, dst: &str) -> Result<(), StoreError>;
}
