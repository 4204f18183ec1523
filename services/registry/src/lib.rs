//! # OCI Distribution registry services
//!
//! Two registry flavours over the content-addressed
//! [`artifact-store`](artifact_store):
//!
//! - [`PrivateRegistry`]: a push/pull registry implementing the OCI
//!   Distribution v2 subset, with manifests by tag or digest, blob reads,
//!   and single-request or chunked blob uploads with digest verification.
//! - [`ProxyRegistry`]: a pull-through cache for an upstream registry
//!   that fills the local store while streaming the response.
//!
//! Both expose an axum [`Router`](axum::Router) mounted at `/v2`.
//! Instances are built by the [`RegistryManager`] from configuration and
//! looked up by DNS-label alias; each resolves its storage backend by
//! alias from the injected [`StoreManager`](artifact_store::StoreManager).

mod digest;
mod error;
mod manager;
pub mod manifest;
mod path;
pub mod private;
pub mod proxy;

/// Response header names shared by the registry surfaces.
pub(crate) mod headers {
    pub(crate) const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
    pub(crate) const DOCKER_UPLOAD_UUID: &str = "docker-upload-uuid";
    pub(crate) const API_VERSION_HEADER: &str = "docker-distribution-api-version";
    pub(crate) const API_VERSION: &str = "registry/2.0";
}

pub use digest::{is_digest, sha256_digest};
pub use error::{RegistryError, RegistryResult};
pub use manager::{Registry, RegistryKind, RegistryManager, RegistryParams, ServiceBinding};
pub use private::PrivateRegistry;
pub use proxy::{ProxyRegistry, UpstreamConfig};
