//! Proxy OCI registry: a pull-through cache in front of an upstream
//! registry.
//!
//! Blobs are immutable by digest and served cache-first; a miss streams
//! the upstream body to the client and into the local store in one pass.
//! Tags are mutable, so manifest reads consult upstream first unless the
//! reference is itself a content digest.

mod client;
mod handlers;
mod service;

pub use client::UpstreamConfig;
pub use service::ProxyRegistry;

pub(crate) use handlers::router;
