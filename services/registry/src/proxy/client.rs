//! HTTP client for the proxied upstream registry.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header;
use reqwest::{Method, StatusCode};
use url::Url;

use crate::{RegistryError, RegistryResult};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, */*";
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Connection settings for an upstream registry.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `https://registry-1.docker.io`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Cache TTL; used when the registry carries no explicit `cacheTTL`.
    pub ttl: Option<Duration>,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            ttl: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UpstreamClient {
    base: String,
    username: Option<String>,
    password: Option<String>,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub(crate) fn new(upstream: &UpstreamConfig) -> RegistryResult<Self> {
        // Validate the base URL once; requests are built by concatenation
        // so an upstream path prefix is preserved.
        Url::parse(&upstream.url).map_err(|err| {
            RegistryError::InvalidConfig(format!("invalid upstream url {}: {err}", upstream.url))
        })?;
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|err| RegistryError::internal(err.to_string()))?;

        Ok(Self {
            base: upstream.url.trim_end_matches('/').to_string(),
            username: upstream.username.clone(),
            password: upstream.password.clone(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, format!("{}{path}", self.base));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RegistryResult<reqwest::Response> {
        request.send().await.map_err(|err| RegistryError::Upstream {
            status: None,
            detail: err.to_string(),
        })
    }

    /// Fetches a manifest; returns the raw bytes and the upstream media
    /// type.
    pub(crate) async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<(Bytes, String)> {
        let response = self
            .send(
                self.request(Method::GET, &format!("/v2/{name}/manifests/{reference}"))
                    .header(header::ACCEPT, MANIFEST_ACCEPT),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status));
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::manifest::MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        let data = response.bytes().await.map_err(|err| RegistryError::Upstream {
            status: Some(status.as_u16()),
            detail: err.to_string(),
        })?;
        Ok((data, media_type))
    }

    /// Whether a manifest exists upstream; returns the advertised digest,
    /// content length (`-1` when upstream does not say), and media type.
    pub(crate) async fn head_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Option<(String, i64, String)>> {
        let response = self
            .send(
                self.request(Method::HEAD, &format!("/v2/{name}/manifests/{reference}"))
                    .header(header::ACCEPT, MANIFEST_ACCEPT),
            )
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let headers = response.headers();
        let digest = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(-1);
        let media_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::manifest::MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        Ok(Some((digest, length, media_type)))
    }

    /// Opens a streaming blob download.
    pub(crate) async fn get_blob(
        &self,
        name: &str,
        digest: &str,
    ) -> RegistryResult<reqwest::Response> {
        let response = self
            .send(self.request(Method::GET, &format!("/v2/{name}/blobs/{digest}")))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status));
        }
        Ok(response)
    }

    /// Whether a blob exists upstream; returns its content length when
    /// advertised.
    pub(crate) async fn head_blob(&self, name: &str, digest: &str) -> RegistryResult<Option<i64>> {
        let response = self
            .send(self.request(Method::HEAD, &format!("/v2/{name}/blobs/{digest}")))
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(
            response.content_length().map(|l| l as i64).unwrap_or(-1),
        ))
    }
}

fn upstream_error(status: StatusCode) -> RegistryError {
    RegistryError::Upstream {
        status: Some(status.as_u16()),
        detail: format!("upstream registry returned status {status}"),
    }
}
