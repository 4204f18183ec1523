use std::time::Duration;

/// Typed errors for storage operations and the storage manager.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No artifact (blob or metadata) exists under the hash.
    #[error("artifact not found: {hash}")]
    NotFound { hash: String },

    /// Create against an existing artifact with a different length.
    /// The blob on disk is left untouched.
    #[error("hash conflict for {hash}: existing length {existing}, incoming length {incoming}")]
    HashConflict {
        hash: String,
        existing: i64,
        incoming: i64,
    },

    /// Move destination is already occupied.
    #[error("artifact already exists: {hash}")]
    AlreadyExists { hash: String },

    /// The per-hash lock could not be acquired in time.
    #[error("lock acquisition timed out for {hash} after {timeout:?}")]
    LockTimeout { hash: String, timeout: Duration },

    /// Delete for a `(name, repo)` that is not among the artifact's
    /// references.
    #[error("reference {name}@{repo} not found on artifact {hash}")]
    ReferenceNotFound {
        hash: String,
        name: String,
        repo: String,
    },

    /// Alias is not a valid RFC-1123 DNS name.
    #[error("invalid DNS name for alias: {0}")]
    InvalidAlias(String),

    /// Alias is already registered.
    #[error("storage alias already exists: {0}")]
    AliasExists(String),

    /// No storage registered under the alias.
    #[error("storage alias not found: {0}")]
    UnknownAlias(String),

    /// No factory registered for the class name.
    #[error("storage class not found: {0}")]
    UnknownClass(String),

    /// The configuration tree for a storage is incomplete or malformed.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(hash: impl Into<String>) -> Self {
        StoreError::NotFound { hash: hash.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Maps an I/O error to `NotFound` for the given hash, passing other
    /// kinds through.
    pub(crate) fn from_io(err: std::io::Error, hash: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::not_found(hash)
        } else {
            StoreError::Io(err)
        }
    }
}
