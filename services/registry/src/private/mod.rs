//! Private OCI registry: local push/pull over the artifact store.
//!
//! Manifests are stored twice: the content under its digest (immutable),
//! and a pointer record under the synthetic key
//! `manifest-ref:{name}:{reference}` whose metadata carries the content
//! digest in its `hash` field. Resolving a tag reads the pointer, then
//! follows the digest.

mod handlers;
mod service;

pub use service::PrivateRegistry;

pub(crate) use handlers::router;
