use std::sync::Arc;
use std::time::Duration;

use artifact_store::{
    unix_now, ArtifactMeta, ArtifactReference, ArtifactStore, BlobReader, ByteRange,
};
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::manager::ServiceBinding;
use crate::{is_digest, sha256_digest, RegistryResult};

use super::client::{UpstreamClient, UpstreamConfig};

/// Cache entries older than this are refetched. Applied when neither the
/// registry nor its upstream configuration carries a TTL.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Buffer size of each in-process pipe in the cache-fill tee.
const PIPE_BUFFER: usize = 64 * 1024;

const REPO_MANIFEST: &str = "manifest";
const REPO_BLOB: &str = "blob";

#[derive(Debug)]
struct ProxyInner {
    alias: String,
    storage_alias: String,
    binding: Option<ServiceBinding>,
    storage: Arc<dyn ArtifactStore>,
    client: UpstreamClient,
    cache_ttl: Duration,
}

/// A caching proxy for one upstream registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProxyRegistry {
    inner: Arc<ProxyInner>,
}

impl ProxyRegistry {
    pub fn new(
        alias: impl Into<String>,
        storage_alias: impl Into<String>,
        storage: Arc<dyn ArtifactStore>,
        upstream: &UpstreamConfig,
        cache_ttl: Option<Duration>,
        binding: Option<ServiceBinding>,
    ) -> RegistryResult<Self> {
        let client = UpstreamClient::new(upstream)?;
        let cache_ttl = cache_ttl.or(upstream.ttl).unwrap_or(DEFAULT_CACHE_TTL);
        Ok(Self {
            inner: Arc::new(ProxyInner {
                alias: alias.into(),
                storage_alias: storage_alias.into(),
                binding,
                storage,
                client,
                cache_ttl,
            }),
        })
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    pub fn storage_alias(&self) -> &str {
        &self.inner.storage_alias
    }

    pub fn binding(&self) -> Option<&ServiceBinding> {
        self.inner.binding.as_ref()
    }

    pub fn cache_ttl(&self) -> Duration {
        self.inner.cache_ttl
    }

    /// The axum router serving this registry's `/v2` surface.
    pub fn router(&self) -> axum::Router {
        super::router(self.clone())
    }

    /// Returns the cached metadata for a digest when present and within
    /// TTL.
    async fn cached(&self, digest: &str) -> Option<ArtifactMeta> {
        let meta = self.inner.storage.get_meta(digest).await.ok()?;
        let age = unix_now() - meta.created_at;
        (age < self.inner.cache_ttl.as_secs() as i64).then_some(meta)
    }

    async fn read_cached(&self, digest: &str) -> Option<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let (mut reader, actual) = self
            .inner
            .storage
            .read(digest, ByteRange::full())
            .await
            .ok()?;
        let mut data = Vec::with_capacity(actual.length.max(0) as usize);
        reader.read_to_end(&mut data).await.ok()?;
        Some(data)
    }

    /// Best-effort cache write for small content; failures are logged and
    /// swallowed.
    async fn fill_cache(&self, digest: &str, data: &[u8], name: &str, repo: &str) {
        let meta = ArtifactMeta {
            hash: digest.to_string(),
            length: data.len() as i64,
            created_at: unix_now(),
            references: vec![ArtifactReference::new(name, repo)],
        };
        let mut reader: &[u8] = data;
        if let Err(err) = self
            .inner
            .storage
            .create(digest, &mut reader, data.len() as i64, Some(meta))
            .await
        {
            tracing::warn!(digest, %err, "cache write failed");
        }
    }

    /// Resolves a manifest. Tags hit upstream first (they are mutable);
    /// digest references are immutable and served cache-first. Returns
    /// bytes, media type, and digest.
    #[tracing::instrument(skip(self), fields(registry = %self.inner.alias))]
    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<(Vec<u8>, String, String)> {
        if is_digest(reference) && self.cached(reference).await.is_some() {
            if let Some(data) = self.read_cached(reference).await {
                tracing::debug!(reference, "manifest served from cache");
                let media_type = crate::manifest::detect_media_type(&data);
                return Ok((data, media_type, reference.to_string()));
            }
        }

        let (data, media_type) = self.inner.client.get_manifest(name, reference).await?;
        let digest = sha256_digest(&data);

        if self.cached(&digest).await.is_some() {
            if let Some(cached) = self.read_cached(&digest).await {
                return Ok((cached, media_type, digest));
            }
        }

        self.fill_cache(&digest, &data, name, REPO_MANIFEST).await;
        Ok((data.to_vec(), media_type, digest))
    }

    /// Whether a manifest exists; returns its digest, length, and media
    /// type. Digest references within TTL are answered from the cache.
    pub async fn head_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Option<(String, i64, String)>> {
        if is_digest(reference) {
            if let Some(meta) = self.cached(reference).await {
                if let Some(data) = self.read_cached(reference).await {
                    let media_type = crate::manifest::detect_media_type(&data);
                    return Ok(Some((reference.to_string(), meta.length, media_type)));
                }
            }
        }
        self.inner.client.head_manifest(name, reference).await
    }

    /// Opens a blob: from cache within TTL, otherwise streamed from
    /// upstream through a pair of in-process pipes that feed the client
    /// response and the cache fill concurrently, in bounded memory.
    #[tracing::instrument(skip(self), fields(registry = %self.inner.alias))]
    pub async fn get_blob(&self, name: &str, digest: &str) -> RegistryResult<(BlobReader, i64)> {
        if let Some(meta) = self.cached(digest).await {
            if let Ok((reader, _)) = self.inner.storage.read(digest, ByteRange::full()).await {
                tracing::debug!(digest, "blob served from cache");
                return Ok((reader, meta.length));
            }
        }

        let response = self.inner.client.get_blob(name, digest).await?;
        let size = response.content_length().map(|l| l as i64).unwrap_or(-1);

        let (cache_writer, cache_reader) = tokio::io::duplex(PIPE_BUFFER);
        let (response_writer, response_reader) = tokio::io::duplex(PIPE_BUFFER);

        // Cache fill: consumes one pipe into the store. A fill cut short
        // by a disconnecting client must not be recorded as a complete
        // blob, so a short write is backed out through the
        // reference-delete path. All failures here are log-only.
        let storage = self.inner.storage.clone();
        let reference = ArtifactReference::new(name, REPO_BLOB);
        let meta = ArtifactMeta {
            hash: digest.to_string(),
            length: size,
            created_at: unix_now(),
            references: vec![reference.clone()],
        };
        let cache_digest = digest.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(cache_reader);
            match storage
                .create(&cache_digest, &mut reader, size, Some(meta))
                .await
            {
                Ok(written) if size >= 0 && written.length != size => {
                    tracing::warn!(
                        digest = %cache_digest,
                        expected = size,
                        written = written.length,
                        "short cache fill, backing out"
                    );
                    if let Err(err) = storage.delete(&cache_digest, &reference).await {
                        tracing::warn!(digest = %cache_digest, %err, "failed to back out short cache fill");
                    }
                }
                Ok(_) => tracing::debug!(digest = %cache_digest, "blob cache filled"),
                Err(err) => tracing::warn!(digest = %cache_digest, %err, "blob cache write failed"),
            }
        });

        // Pump: one pass over the upstream body feeds both pipes. A dead
        // cache side stops the tee without ending the client stream; a
        // dropped client ends the fill early, which is backed out above.
        let pump_digest = digest.to_string();
        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut cache_writer = Some(cache_writer);
            let mut response_writer = response_writer;
            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!(digest = %pump_digest, %err, "upstream blob stream failed");
                        return;
                    }
                };
                if let Some(writer) = cache_writer.as_mut() {
                    if writer.write_all(&chunk).await.is_err() {
                        cache_writer = None;
                    }
                }
                if response_writer.write_all(&chunk).await.is_err() {
                    return;
                }
            }
        });

        Ok((Box::new(response_reader), size))
    }

    /// Whether a blob exists: cache TTL first, then a HEAD upstream.
    pub async fn head_blob(&self, name: &str, digest: &str) -> RegistryResult<Option<i64>> {
        if let Some(meta) = self.cached(digest).await {
            return Ok(Some(meta.length));
        }
        self.inner.client.head_blob(name, digest).await
    }
}
