//! Hash-computing decorator.
//!
//! Accepts creates with an *unresolved* hash (empty, shorter than three
//! characters, or the literal `UNKNOWN` in any case), streams the content
//! to a temporary key while hashing it, and then promotes the temp
//! artifact to its content digest: by a rename when the digest is new, or
//! by a reference merge when identical content already exists. All other
//! operations forward to the inner store untouched.

use sha2::{Digest, Sha256};
use tokio::io::BufReader;
use tokio_util::io::InspectReader;
use uuid::Uuid;

use crate::{
    ArtifactMeta, ArtifactReference, ArtifactStore, BlobReader, ByteRange, MovableStore, Reader,
    StoreError,
};

/// Sentinel reference used to drive temp cleanup through the
/// reference-counted delete path, so that path stays the only code that
/// ever trashes blobs.
const CLEANUP_REF: &str = "temp-cleanup";

#[derive(Debug)]
pub struct HashComputingStore<S> {
    inner: S,
}

impl<S: MovableStore> HashComputingStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn is_unknown_hash(hash: &str) -> bool {
        hash.is_empty() || hash.len() < 3 || hash.eq_ignore_ascii_case("unknown")
    }

    fn temp_key() -> String {
        format!("temp-{}", Uuid::new_v4())
    }

    /// Removes a temp artifact by draining its references through
    /// `delete`; a reference-less meta first gets the sentinel reference
    /// so there is something to remove. Best-effort.
    async fn cleanup_temp(&self, temp: &str) {
        let mut meta = match self.inner.get_meta(temp).await {
            Ok(meta) => meta,
            // Nothing left to clean up.
            Err(_) => return,
        };

        if meta.references.is_empty() {
            meta.references
                .push(ArtifactReference::new(CLEANUP_REF, CLEANUP_REF));
            if let Err(err) = self.inner.update_meta(meta.clone()).await {
                tracing::warn!(temp, %err, "failed to add cleanup reference to temp artifact");
                return;
            }
        }

        for reference in meta.references {
            match self.inner.delete(temp, &reference).await {
                Ok(None) => return,
                Ok(Some(_)) => continue,
                Err(err) => {
                    tracing::warn!(temp, %err, "failed to delete temp artifact");
                    return;
                }
            }
        }
    }

    /// Create-on-existing for the computed digest: merge the caller's
    /// references through the zero-byte create branch.
    async fn merge_into_existing(
        &self,
        digest: &str,
        existing: ArtifactMeta,
        meta: Option<ArtifactMeta>,
        written: i64,
    ) -> Result<ArtifactMeta, StoreError> {
        match meta {
            Some(meta) if !meta.references.is_empty() => {
                let mut empty = tokio::io::empty();
                self.inner
                    .create(digest, &mut empty, written, Some(meta))
                    .await
            }
            _ => Ok(existing),
        }
    }
}

#[async_trait::async_trait]
impl<S: MovableStore> ArtifactStore for HashComputingStore<S> {
    fn alias(&self) -> &str {
        self.inner.alias()
    }

    #[tracing::instrument(skip(self, reader, meta))]
    async fn create(
        &self,
        hash: &str,
        reader: &mut Reader<'_>,
        size: i64,
        meta: Option<ArtifactMeta>,
    ) -> Result<ArtifactMeta, StoreError> {
        if !Self::is_unknown_hash(hash) {
            return self.inner.create(hash, reader, size, meta).await;
        }

        let temp = Self::temp_key();
        let mut hasher = Sha256::new();
        let mut tee = BufReader::new(InspectReader::new(reader, |chunk| hasher.update(chunk)));
        let temp_meta = self.inner.create(&temp, &mut tee, size, meta.clone()).await?;
        drop(tee);
        let digest = hex::encode(hasher.finalize());
        tracing::debug!(%temp, %digest, "computed content digest for unresolved hash");

        match self.inner.get_meta(&digest).await {
            Ok(existing) => {
                // Identical content already stored: drop the temp copy and
                // merge the caller's references.
                self.cleanup_temp(&temp).await;
                self.merge_into_existing(&digest, existing, meta, temp_meta.length)
                    .await
            }
            Err(err) if err.is_not_found() => {
                match self.inner.move_artifact(&temp, &digest).await {
                    // The rename re-keys the metadata, so a fresh read
                    // returns the promoted artifact (plus any references a
                    // concurrent caller merged in the meantime).
                    Ok(()) => self.inner.get_meta(&digest).await,
                    Err(move_err) => {
                        // A concurrent create may have claimed the digest
                        // between the existence check and the rename.
                        match self.inner.get_meta(&digest).await {
                            Ok(existing) => {
                                self.cleanup_temp(&temp).await;
                                self.merge_into_existing(&digest, existing, meta, temp_meta.length)
                                    .await
                            }
                            Err(_) => {
                                self.cleanup_temp(&temp).await;
                                Err(move_err)
                            }
                        }
                    }
                }
            }
            Err(err) => {
                self.cleanup_temp(&temp).await;
                Err(err)
            }
        }
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
        self.inner.delete(hash, reference).await
    }

    async fn get_meta(&self, hash: &str) -> Result<ArtifactMeta, StoreError> {
        self.inner.get_meta(hash).await
    }

    async fn update_meta(&self, meta: ArtifactMeta) -> Result<ArtifactMeta, StoreError> {
        self.inner.update_meta(meta).await
    }
}
