//! # Content-addressed artifact storage
//!
//! Streaming blob storage keyed by hash with a git-style sharded directory
//! layout, per-artifact JSON metadata, reference-counted deletion into a
//! trash subtree, and cross-process per-hash locking.
//!
//! The crate is organised as a stack of decorators over a plain file
//! store:
//!
//! ```text
//! HashComputingStore      accepts unknown hashes, promotes by content digest
//!   └─ ConcurrentStore    per-hash advisory file locks around writes
//!        └─ SimpleFileStore   sharded blobs + metadata + trash
//! ```
//!
//! Each layer owns its inner store and forwards the operations it does not
//! affect. [`StoreManager`] builds the stacks from configuration and hands
//! them out by DNS-label alias.

mod concurrent;
mod error;
mod hashing;
mod lock;
mod manager;
mod meta;
mod simple;
mod store;

pub use concurrent::ConcurrentStore;
pub use error::StoreError;
pub use hashing::HashComputingStore;
pub use lock::{LockGuard, LockManager};
pub use manager::{StoreManager, StoreParams};
pub use meta::{unix_now, ArtifactMeta, ArtifactReference, ByteRange};
pub use simple::SimpleFileStore;
pub use store::{ArtifactStore, BlobReader, MovableStore, Reader};
