//! Plain file-backed artifact store.
//!
//! Blobs live under a git-style sharded layout relative to the base
//! directory: `D/H[0:2]/H[2:]` with metadata at the sibling
//! `D/H[0:2]/H[2:].meta.json`, and trashed artifacts under the mirrored
//! `.trash/` subtree. Metadata writes go through a temp file plus rename.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use uuid::Uuid;

use crate::{
    ArtifactMeta, ArtifactReference, ArtifactStore, BlobReader, ByteRange, MovableStore, Reader,
    StoreError,
};

const TRASH_DIR: &str = ".trash";

#[derive(Debug)]
pub struct SimpleFileStore {
    alias: String,
    base: Utf8PathBuf,
}

impl SimpleFileStore {
    /// Creates the store, ensuring the base directory exists.
    pub fn new(alias: impl Into<String>, base: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            alias: alias.into(),
            base,
        })
    }

    fn shard(root: &Utf8Path, hash: &str) -> Utf8PathBuf {
        if hash.len() < 2 || !hash.is_char_boundary(2) {
            return root.join(hash);
        }
        root.join(&hash[..2]).join(&hash[2..])
    }

    fn blob_path(&self, hash: &str) -> Utf8PathBuf {
        Self::shard(&self.base, hash)
    }

    fn meta_path(&self, hash: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.meta.json", self.blob_path(hash)))
    }

    fn trash_blob_path(&self, hash: &str) -> Utf8PathBuf {
        Self::shard(&self.base.join(TRASH_DIR), hash)
    }

    fn trash_meta_path(&self, hash: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.meta.json", self.trash_blob_path(hash)))
    }

    async fn ensure_parent(path: &Utf8Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_meta(&self, hash: &str) -> Result<ArtifactMeta, StoreError> {
        let data = tokio::fs::read(self.meta_path(hash))
            .await
            .map_err(|err| StoreError::from_io(err, hash))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes metadata for `hash` atomically: temp file in the same
    /// directory, then rename over the destination.
    async fn write_meta(&self, hash: &str, meta: &ArtifactMeta) -> Result<(), StoreError> {
        let path = self.meta_path(hash);
        Self::ensure_parent(&path).await?;
        let tmp = Utf8PathBuf::from(format!("{path}.tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec(meta)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArtifactStore for SimpleFileStore {
    fn alias(&self) -> &str {
        &self.alias
    }

    #[tracing::instrument(skip(self, reader, meta), fields(alias = %self.alias))]
    async fn create(
        &self,
        hash: &str,
        reader: &mut Reader<'_>,
        size: i64,
        meta: Option<ArtifactMeta>,
    ) -> Result<ArtifactMeta, StoreError> {
        let blob = self.blob_path(hash);

        if tokio::fs::try_exists(&blob).await? {
            match self.read_meta(hash).await {
                Ok(mut existing) => {
                    if size >= 0 && size != existing.length {
                        return Err(StoreError::HashConflict {
                            hash: hash.to_string(),
                            existing: existing.length,
                            incoming: size,
                        });
                    }
                    if let Some(meta) = meta {
                        existing.merge_references(&meta.references);
                    }
                    self.write_meta(hash, &existing).await?;
                    tracing::debug!(hash, "merged references into existing artifact");
                    return Ok(existing);
                }
                // Blob without metadata is the residue of an interrupted
                // write; fall through and rewrite it.
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        Self::ensure_parent(&blob).await?;
        let mut file = File::create(&blob).await?;
        let written = tokio::io::copy_buf(&mut *reader, &mut file).await? as i64;
        file.flush().await?;

        let mut final_meta = meta.unwrap_or_else(|| ArtifactMeta {
            hash: String::new(),
            length: 0,
            created_at: 0,
            references: Vec::new(),
        });
        if final_meta.hash.is_empty() {
            final_meta.hash = hash.to_string();
        }
        final_meta.length = written;
        if final_meta.created_at == 0 {
            let modified = file.metadata().await?.modified()?;
            final_meta.created_at = chrono::DateTime::<chrono::Utc>::from(modified).timestamp();
        }
        self.write_meta(hash, &final_meta).await?;
        Ok(final_meta)
    }

    async fn read(
        &self,
        hash: &str,
        range: ByteRange,
    ) -> Result<(BlobReader, ByteRange), StoreError> {
        let mut file = File::open(self.blob_path(hash))
            .await
            .map_err(|err| StoreError::from_io(err, hash))?;
        let size = file.metadata().await?.len() as i64;
        let actual = range.clamp_to(size);
        file.seek(SeekFrom::Start(actual.offset as u64)).await?;
        let reader: BlobReader = Box::new(file.take(actual.length as u64));
        Ok((reader, actual))
    }

    async fn update(
        &self,
        hash: &str,
        range: ByteRange,
        reader: &mut Reader<'_>,
    ) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.blob_path(hash))
            .await
            .map_err(|err| StoreError::from_io(err, hash))?;
        let size = file.metadata().await?.len() as i64;
        let offset = range.offset.max(0);

        if offset > size {
            // Pad the gap with zeros, streamed in chunks.
            file.seek(SeekFrom::End(0)).await?;
            let zeros = [0u8; 8192];
            let mut remaining = (offset - size) as u64;
            while remaining > 0 {
                let n = remaining.min(zeros.len() as u64) as usize;
                file.write_all(&zeros[..n]).await?;
                remaining -= n as u64;
            }
        } else {
            file.seek(SeekFrom::Start(offset as u64)).await?;
        }

        if range.length >= 0 {
            let mut limited = (&mut *reader).take(range.length as u64);
            tokio::io::copy(&mut limited, &mut file).await?;
        } else {
            tokio::io::copy_buf(&mut *reader, &mut file).await?;
        }
        file.flush().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, reference), fields(alias = %self.alias))]
    async fn delete(
        &self,
        hash: &str,
        reference: &ArtifactReference,
    ) -> Result<Option<ArtifactMeta>, StoreError> {
        let mut meta = self.read_meta(hash).await?;
        if !meta.remove_reference(reference) {
            return Err(StoreError::ReferenceNotFound {
                hash: hash.to_string(),
                name: reference.name.clone(),
                repo: reference.repo.clone(),
            });
        }

        if !meta.references.is_empty() {
            self.write_meta(hash, &meta).await?;
            return Ok(Some(meta));
        }

        // Last reference gone: move blob and metadata into the trash
        // subtree. The metadata rename tolerates an already-missing file.
        let trash_blob = self.trash_blob_path(hash);
        Self::ensure_parent(&trash_blob).await?;
        tokio::fs::rename(self.blob_path(hash), &trash_blob)
            .await
            .map_err(|err| StoreError::from_io(err, hash))?;
        match tokio::fs::rename(self.meta_path(hash), self.trash_meta_path(hash)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = self.blob_path(hash).parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        tracing::debug!(hash, "artifact moved to trash");
        Ok(None)
    }

    async fn get_meta(&self, hash: &str) -> Result<ArtifactMeta, StoreError> {
        self.read_meta(hash).await
    }

    async fn update_meta(&self, meta: ArtifactMeta) -> Result<ArtifactMeta, StoreError> {
        let hash = meta.hash.clone();
        self.write_meta(&hash, &meta).await?;
        Ok(meta)
    }
}

#[async_trait::async_trait]
impl MovableStore for SimpleFileStore {
    #[tracing::instrument(skip(self), fields(alias = %self.alias))]
    async fn move_artifact(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let dst_blob = self.blob_path(dst);
        if tokio::fs::try_exists(&dst_blob).await? {
            return Err(StoreError::AlreadyExists {
                hash: dst.to_string(),
            });
        }
        Self::ensure_parent(&dst_blob).await?;
        tokio::fs::rename(self.blob_path(src), &dst_blob)
            .await
            .map_err(|err| StoreError::from_io(err, src))?;
        match tokio::fs::rename(self.meta_path(src), self.meta_path(dst)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        // Keep the metadata's hash field in step with its new key.
        if let Ok(mut meta) = self.read_meta(dst).await {
            if meta.hash != dst {
                meta.hash = dst.to_string();
                self.write_meta(dst, &meta).await?;
            }
        }
        if let Some(parent) = self.blob_path(src).parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
