use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use artifact_store::{
    unix_now, ArtifactMeta, ArtifactReference, ArtifactStore, BlobReader, ByteRange, Reader,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::io::InspectReader;
use uuid::Uuid;

use crate::manager::ServiceBinding;
use crate::{sha256_digest, RegistryError, RegistryResult};

/// Upload sessions expire an hour after creation; the sweep runs on the
/// same cadence.
const SESSION_TTL: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Reference repo labels recorded on stored artifacts.
const REPO_MANIFEST: &str = "manifest";
const REPO_BLOB: &str = "blob";

/// State of one chunked blob upload. Lives in process memory only;
/// chunks accumulate in `buffer` until completion stores the blob.
#[derive(Debug)]
pub(crate) struct UploadSession {
    name: String,
    offset: i64,
    created_at: Instant,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct PrivateInner {
    alias: String,
    storage_alias: String,
    description: String,
    binding: Option<ServiceBinding>,
    storage: Arc<dyn ArtifactStore>,
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

/// A private registry instance. Cheap to clone; the upload session map is
/// shared between clones.
#[derive(Debug, Clone)]
pub struct PrivateRegistry {
    inner: Arc<PrivateInner>,
}

impl PrivateRegistry {
    /// Creates the registry and starts its hourly session sweep. The
    /// sweep task ends when the last clone of the registry is dropped.
    pub fn new(
        alias: impl Into<String>,
        storage_alias: impl Into<String>,
        storage: Arc<dyn ArtifactStore>,
        binding: Option<ServiceBinding>,
        description: impl Into<String>,
    ) -> Self {
        let inner = Arc::new(PrivateInner {
            alias: alias.into(),
            storage_alias: storage_alias.into(),
            description: description.into(),
            binding,
            storage,
            sessions: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let dropped = expire_sessions(&inner.sessions, SESSION_TTL).await;
                if dropped > 0 {
                    tracing::debug!(dropped, "expired stale upload sessions");
                }
            }
        });

        Self { inner }
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    pub fn storage_alias(&self) -> &str {
        &self.inner.storage_alias
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn binding(&self) -> Option<&ServiceBinding> {
        self.inner.binding.as_ref()
    }

    /// The axum router serving this registry's `/v2` surface.
    pub fn router(&self) -> axum::Router {
        super::router(self.clone())
    }

    fn manifest_ref_key(name: &str, reference: &str) -> String {
        format!("manifest-ref:{name}:{reference}")
    }

    async fn read_fully(&self, hash: &str) -> Result<Vec<u8>, artifact_store::StoreError> {
        let (mut reader, actual) = self.inner.storage.read(hash, ByteRange::full()).await?;
        let mut data = Vec::with_capacity(actual.length.max(0) as usize);
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Resolves a manifest by tag or digest: pointer record first, then
    /// the content blob it names. Returns bytes, media type, and digest.
    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<(Vec<u8>, String, String)> {
        let pointer = self
            .inner
            .storage
            .get_meta(&Self::manifest_ref_key(name, reference))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    RegistryError::ManifestUnknown {
                        reference: reference.to_string(),
                    }
                } else {
                    err.into()
                }
            })?;

        let digest = pointer.hash;
        if digest.is_empty() {
            return Err(RegistryError::ManifestUnknown {
                reference: reference.to_string(),
            });
        }

        let data = self.read_fully(&digest).await.map_err(|err| {
            if err.is_not_found() {
                RegistryError::ManifestUnknown {
                    reference: reference.to_string(),
                }
            } else {
                err.into()
            }
        })?;
        let media_type = crate::manifest::detect_media_type(&data);
        Ok((data, media_type, digest))
    }

    /// Whether a manifest exists for the reference; returns its digest,
    /// byte length, and media type (the headers a HEAD response carries).
    pub async fn head_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Option<(String, i64, String)>> {
        let pointer = match self
            .inner
            .storage
            .get_meta(&Self::manifest_ref_key(name, reference))
            .await
        {
            Ok(pointer) => pointer,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if pointer.hash.is_empty() {
            return Ok(None);
        }
        let meta = match self.inner.storage.get_meta(&pointer.hash).await {
            Ok(meta) => meta,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // The media type lives in the document itself.
        let data = match self.read_fully(&pointer.hash).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let media_type = crate::manifest::detect_media_type(&data);
        Ok(Some((pointer.hash, meta.length, media_type)))
    }

    /// Stores manifest content under its digest and writes (or retargets)
    /// the tag pointer. Returns the content digest.
    #[tracing::instrument(skip(self, data), fields(registry = %self.inner.alias))]
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        data: &[u8],
    ) -> RegistryResult<String> {
        let digest = sha256_digest(data);

        let meta = ArtifactMeta {
            hash: digest.clone(),
            length: data.len() as i64,
            created_at: unix_now(),
            references: vec![ArtifactReference::new(name, REPO_MANIFEST)],
        };
        let mut reader: &[u8] = data;
        self.inner
            .storage
            .create(&digest, &mut reader, data.len() as i64, Some(meta))
            .await?;

        let key = Self::manifest_ref_key(name, reference);
        match self.inner.storage.get_meta(&key).await {
            Ok(mut pointer) => {
                // Existing tag: retarget it at the new digest.
                pointer.hash = digest.clone();
                self.inner.storage.update_meta(pointer).await?;
            }
            Err(err) if err.is_not_found() => {
                let pointer = ArtifactMeta {
                    hash: digest.clone(),
                    length: 0,
                    created_at: unix_now(),
                    references: Vec::new(),
                };
                let mut empty: &[u8] = b"";
                self.inner
                    .storage
                    .create(&key, &mut empty, 0, Some(pointer))
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(name, reference, %digest, "manifest stored");
        Ok(digest)
    }

    /// Opens a blob for streaming. Returns the reader and the blob length.
    pub async fn get_blob(&self, digest: &str) -> RegistryResult<(BlobReader, i64)> {
        let not_found = || RegistryError::BlobUnknown {
            digest: digest.to_string(),
        };
        let meta = self
            .inner
            .storage
            .get_meta(digest)
            .await
            .map_err(|err| if err.is_not_found() { not_found() } else { err.into() })?;
        let (reader, _) = self
            .inner
            .storage
            .read(digest, ByteRange::full())
            .await
            .map_err(|err| if err.is_not_found() { not_found() } else { err.into() })?;
        Ok((reader, meta.length))
    }

    /// Whether a blob exists; returns its length.
    pub async fn head_blob(&self, digest: &str) -> RegistryResult<Option<i64>> {
        match self.inner.storage.get_meta(digest).await {
            Ok(meta) => Ok(Some(meta.length)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams a blob into storage under a declared digest, validating the
    /// content hash on the way through. On mismatch the freshly stored
    /// blob is removed again (best effort) through the reference-delete
    /// path.
    #[tracing::instrument(skip(self, reader), fields(registry = %self.inner.alias))]
    pub async fn put_blob(
        &self,
        name: &str,
        digest: &str,
        reader: &mut Reader<'_>,
        size: i64,
    ) -> RegistryResult<()> {
        let reference = ArtifactReference::new(name, REPO_BLOB);

        match self.inner.storage.get_meta(digest).await {
            Ok(existing) => {
                // Blob already stored: still consume and verify the
                // client's bytes, then merge the reference.
                let mut hasher = Sha256::new();
                let mut tee =
                    BufReader::new(InspectReader::new(reader, |chunk| hasher.update(chunk)));
                tokio::io::copy_buf(&mut tee, &mut tokio::io::sink())
                    .await
                    .map_err(artifact_store::StoreError::Io)?;
                drop(tee);
                let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                if actual != digest {
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual,
                    });
                }

                let meta = ArtifactMeta {
                    hash: digest.to_string(),
                    length: existing.length,
                    created_at: unix_now(),
                    references: vec![reference],
                };
                let mut empty: &[u8] = b"";
                self.inner
                    .storage
                    .create(digest, &mut empty, existing.length, Some(meta))
                    .await?;
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                let mut hasher = Sha256::new();
                let mut tee =
                    BufReader::new(InspectReader::new(reader, |chunk| hasher.update(chunk)));
                let meta = ArtifactMeta {
                    hash: digest.to_string(),
                    length: size,
                    created_at: unix_now(),
                    references: vec![reference.clone()],
                };
                self.inner
                    .storage
                    .create(digest, &mut tee, size, Some(meta))
                    .await?;
                drop(tee);

                let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                if actual != digest {
                    if let Err(err) = self.inner.storage.delete(digest, &reference).await {
                        tracing::warn!(digest, %err, "failed to remove blob after digest mismatch");
                    }
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual,
                    });
                }
                tracing::debug!(name, digest, "blob stored");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Opens a chunked upload session.
    pub async fn start_upload(&self, name: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        self.inner.sessions.write().await.insert(
            uuid,
            UploadSession {
                name: name.to_string(),
                offset: 0,
                created_at: Instant::now(),
                buffer: Vec::new(),
            },
        );
        tracing::debug!(name, %uuid, "upload session started");
        uuid
    }

    /// Appends a chunk to a session. A chunk at the session's current
    /// offset extends it; any other offset is tolerated by appending and
    /// re-syncing the offset to the buffer length.
    pub async fn upload_chunk(
        &self,
        name: &str,
        uuid: Uuid,
        chunk: &[u8],
        offset: i64,
    ) -> RegistryResult<i64> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(&uuid)
            .filter(|session| session.name == name)
            .ok_or_else(|| RegistryError::UploadUnknown {
                uuid: uuid.to_string(),
            })?;

        session.buffer.extend_from_slice(chunk);
        if offset == session.offset {
            session.offset += chunk.len() as i64;
        } else {
            session.offset = session.buffer.len() as i64;
        }
        Ok(session.offset)
    }

    /// Finalises an upload: concatenates the accumulated buffer with the
    /// final chunk and stores the result under the declared digest.
    pub async fn complete_upload(
        &self,
        name: &str,
        uuid: Uuid,
        digest: &str,
        final_chunk: &[u8],
    ) -> RegistryResult<()> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(&uuid)
            .filter(|session| session.name == name)
            .ok_or_else(|| RegistryError::UploadUnknown {
                uuid: uuid.to_string(),
            })?;

        let mut data = session.buffer;
        data.extend_from_slice(final_chunk);
        let size = data.len() as i64;
        let mut reader: &[u8] = &data;
        self.put_blob(name, digest, &mut reader, size).await
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn expire_sessions_now(&self) -> usize {
        expire_sessions(&self.inner.sessions, Duration::ZERO).await
    }
}

async fn expire_sessions(
    sessions: &RwLock<HashMap<Uuid, UploadSession>>,
    ttl: Duration,
) -> usize {
    let now = Instant::now();
    let mut sessions = sessions.write().await;
    let before = sessions.len();
    sessions.retain(|_, session| now.duration_since(session.created_at) < ttl);
    before - sessions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use artifact_store::SimpleFileStore;

    fn registry() -> (tempfile::TempDir, PrivateRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let storage: Arc<dyn ArtifactStore> =
            Arc::new(SimpleFileStore::new("test", base).unwrap());
        let registry = PrivateRegistry::new("private", "test", storage, None, "");
        (dir, registry)
    }

    #[tokio::test]
    async fn manifest_round_trip_by_tag_and_digest() {
        let (_dir, registry) = registry();
        let manifest = br#"{"schemaVersion":2,"config":{},"layers":[]}"#;

        let digest = registry
            .put_manifest("lib/alpine", "latest", manifest)
            .await
            .unwrap();

        let (by_tag, media, returned) =
            registry.get_manifest("lib/alpine", "latest").await.unwrap();
        assert_eq!(by_tag, manifest);
        assert_eq!(returned, digest);
        assert_eq!(media, crate::manifest::MEDIA_TYPE_DOCKER_MANIFEST);

        // The content is also addressable by a pointer keyed on the digest
        // itself once pushed by digest.
        registry
            .put_manifest("lib/alpine", &digest, manifest)
            .await
            .unwrap();
        let (by_digest, _, _) = registry.get_manifest("lib/alpine", &digest).await.unwrap();
        assert_eq!(by_digest, manifest);
    }

    #[tokio::test]
    async fn tag_repush_retargets_pointer() {
        let (_dir, registry) = registry();
        let first = br#"{"schemaVersion":2,"config":{"a":1}}"#;
        let second = br#"{"schemaVersion":2,"config":{"a":2}}"#;

        let d1 = registry.put_manifest("repo", "latest", first).await.unwrap();
        let d2 = registry
            .put_manifest("repo", "latest", second)
            .await
            .unwrap();
        assert_ne!(d1, d2);

        let (data, _, digest) = registry.get_manifest("repo", "latest").await.unwrap();
        assert_eq!(data, second);
        assert_eq!(digest, d2);
    }

    #[tokio::test]
    async fn blob_put_get_and_digest_mismatch() {
        let (_dir, registry) = registry();
        let data = b"layer bytes";
        let digest = sha256_digest(data);

        let mut reader: &[u8] = data;
        registry
            .put_blob("repo", &digest, &mut reader, data.len() as i64)
            .await
            .unwrap();

        let (mut blob, length) = registry.get_blob(&digest).await.unwrap();
        let mut buf = Vec::new();
        blob.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);
        assert_eq!(length, data.len() as i64);

        // Wrong digest: rejected, and nothing remains stored.
        let bad = format!("sha256:{}", "0".repeat(64));
        let mut reader: &[u8] = b"other bytes";
        let err = registry
            .put_blob("repo", &bad, &mut reader, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert_eq!(registry.head_blob(&bad).await.unwrap(), None);
    }

    #[tokio::test]
    async fn repush_of_existing_blob_merges_reference() {
        let (_dir, registry) = registry();
        let data = b"shared layer";
        let digest = sha256_digest(data);

        let mut reader: &[u8] = data;
        registry
            .put_blob("repo-a", &digest, &mut reader, data.len() as i64)
            .await
            .unwrap();
        let mut reader: &[u8] = data;
        registry
            .put_blob("repo-b", &digest, &mut reader, data.len() as i64)
            .await
            .unwrap();

        let meta = registry.inner.storage.get_meta(&digest).await.unwrap();
        assert_eq!(meta.references.len(), 2);
    }

    #[tokio::test]
    async fn chunked_upload_lifecycle() {
        let (_dir, registry) = registry();
        let uuid = registry.start_upload("lib/alpine").await;

        let offset = registry
            .upload_chunk("lib/alpine", uuid, b"chunk1", 0)
            .await
            .unwrap();
        assert_eq!(offset, 6);
        let offset = registry
            .upload_chunk("lib/alpine", uuid, b"chunk2final", 6)
            .await
            .unwrap();
        assert_eq!(offset, 17);

        let digest = sha256_digest(b"chunk1chunk2final");
        registry
            .complete_upload("lib/alpine", uuid, &digest, b"")
            .await
            .unwrap();
        assert_eq!(registry.session_count().await, 0);

        let (mut blob, _) = registry.get_blob(&digest).await.unwrap();
        let mut buf = Vec::new();
        blob.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"chunk1chunk2final");
    }

    #[tokio::test]
    async fn mismatched_chunk_offset_appends_and_resyncs() {
        let (_dir, registry) = registry();
        let uuid = registry.start_upload("repo").await;

        registry.upload_chunk("repo", uuid, b"abc", 0).await.unwrap();
        // Wrong offset: tolerated, appended, offset re-synced.
        let offset = registry
            .upload_chunk("repo", uuid, b"def", 99)
            .await
            .unwrap();
        assert_eq!(offset, 6);
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let (_dir, registry) = registry();
        let uuid = Uuid::new_v4();
        let err = registry
            .upload_chunk("repo", uuid, b"x", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UploadUnknown { .. }));

        // A session opened for one repository is invisible to another.
        let uuid = registry.start_upload("repo").await;
        let err = registry
            .upload_chunk("other", uuid, b"x", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UploadUnknown { .. }));
    }

    #[tokio::test]
    async fn session_expiry_sweep() {
        let (_dir, registry) = registry();
        registry.start_upload("repo").await;
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.expire_sessions_now().await, 1);
        assert_eq!(registry.session_count().await, 0);
    }
}
