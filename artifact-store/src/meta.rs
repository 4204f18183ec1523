//! Artifact metadata and byte-range models.
//!
//! Metadata is stored next to each blob as UTF-8 JSON with the field names
//! used on disk: `{hash, length, createdTimestamp, references: [{name,
//! repo, referencedTimestamp}]}`. Unknown fields are ignored on read.

use serde::{Deserialize, Serialize};

/// Current wall-clock time as UNIX seconds, the timestamp unit used in
/// metadata files.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A named usage pointer to an artifact. Two references are the same
/// reference iff `name` and `repo` match; the timestamp is advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub name: String,
    pub repo: String,
    #[serde(rename = "referencedTimestamp", default)]
    pub referenced_at: i64,
}

impl ArtifactReference {
    /// Creates a reference stamped with the current time.
    pub fn new(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            referenced_at: unix_now(),
        }
    }

    /// Identity under the `(name, repo)` equality used by the reference
    /// set; timestamps do not participate.
    pub fn matches(&self, other: &ArtifactReference) -> bool {
        self.name == other.name && self.repo == other.repo
    }
}

/// Per-artifact metadata: byte length, creation time and the set of live
/// references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub hash: String,
    #[serde(default)]
    pub length: i64,
    #[serde(rename = "createdTimestamp", default)]
    pub created_at: i64,
    #[serde(default)]
    pub references: Vec<ArtifactReference>,
}

impl ArtifactMeta {
    pub fn new(hash: impl Into<String>, length: i64) -> Self {
        Self {
            hash: hash.into(),
            length,
            created_at: unix_now(),
            references: Vec::new(),
        }
    }

    pub fn with_reference(mut self, reference: ArtifactReference) -> Self {
        self.references.push(reference);
        self
    }

    /// Merges `incoming` into the reference set: an existing `(name, repo)`
    /// entry keeps the newer timestamp, anything else is appended.
    pub fn merge_references(&mut self, incoming: &[ArtifactReference]) {
        for reference in incoming {
            match self.references.iter_mut().find(|r| r.matches(reference)) {
                Some(existing) => {
                    existing.referenced_at = existing.referenced_at.max(reference.referenced_at);
                }
                None => self.references.push(reference.clone()),
            }
        }
    }

    /// Removes the single reference matching `(name, repo)`. Returns
    /// whether a reference was removed.
    pub fn remove_reference(&mut self, reference: &ArtifactReference) -> bool {
        match self.references.iter().position(|r| r.matches(reference)) {
            Some(index) => {
                self.references.remove(index);
                true
            }
            None => false,
        }
    }
}

/// A byte range over a blob. `offset` is 0-based; `length == -1` means
/// "until the end of the blob".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: i64,
    pub length: i64,
}

impl ByteRange {
    pub const TO_END: i64 = -1;

    pub fn new(offset: i64, length: i64) -> Self {
        Self { offset, length }
    }

    /// The whole blob.
    pub fn full() -> Self {
        Self {
            offset: 0,
            length: Self::TO_END,
        }
    }

    /// Clamps the range against a blob of `file_size` bytes, resolving
    /// `-1` lengths and out-of-bounds offsets to the range that can
    /// actually be served.
    pub fn clamp_to(&self, file_size: i64) -> ByteRange {
        let offset = self.offset.clamp(0, file_size);
        let mut length = self.length;
        if length == Self::TO_END || offset + length > file_size {
            length = file_size - offset;
        }
        if length < 0 {
            length = 0;
        }
        ByteRange { offset, length }
    }
}
