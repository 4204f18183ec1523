//! Proxy registry tests against a wiremock upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use camino::Utf8Path;
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use artifact_store::{ArtifactStore, ByteRange, SimpleFileStore};
use registry::{ProxyRegistry, UpstreamConfig};

fn sha256_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn proxy_over(
    upstream: &MockServer,
    cache_ttl: Option<Duration>,
) -> (tempfile::TempDir, Arc<dyn ArtifactStore>, ProxyRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let base = Utf8Path::from_path(dir.path()).unwrap().to_owned();
    let storage: Arc<dyn ArtifactStore> = Arc::new(SimpleFileStore::new("cache", base).unwrap());
    let registry = ProxyRegistry::new(
        "hub",
        "cache",
        storage.clone(),
        &UpstreamConfig::new(upstream.uri()),
        cache_ttl,
        None,
    )
    .unwrap();
    (dir, storage, registry)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Waits for the background cache-fill task to land the blob in storage.
async fn await_cached(storage: &Arc<dyn ArtifactStore>, digest: &str) {
    for _ in 0..100 {
        if storage.get_meta(digest).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cache fill for {digest} never completed");
}

#[tokio::test]
async fn blob_miss_streams_and_fills_cache() {
    let upstream = MockServer::start().await;
    // Large enough to force several trips through the pipe buffers.
    let blob: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let digest = sha256_of(&blob);

    Mock::given(method("GET"))
        .and(path(format!("/v2/lib/alpine/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
        .expect(1)
        .mount(&upstream)
        .await;

    let (_dir, storage, registry) = proxy_over(&upstream, None);
    let app = registry.router();

    // Miss: the response is byte-identical to upstream.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v2/lib/alpine/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, blob);

    // The cache fill recorded exactly the upstream byte count.
    await_cached(&storage, &digest).await;
    let meta = storage.get_meta(&digest).await.unwrap();
    assert_eq!(meta.length, blob.len() as i64);
    let (mut reader, _) = storage.read(&digest, ByteRange::full()).await.unwrap();
    let mut cached = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut cached)
        .await
        .unwrap();
    assert_eq!(cached, blob);

    // Hit: served from cache; the mock's expect(1) verifies upstream saw
    // a single request.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/lib/alpine/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, blob);
}

#[tokio::test]
async fn expired_cache_refetches_from_upstream() {
    let upstream = MockServer::start().await;
    let blob = b"short lived".to_vec();
    let digest = sha256_of(&blob);

    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
        .expect(2)
        .mount(&upstream)
        .await;

    // Zero TTL: every entry is immediately stale.
    let (_dir, storage, registry) = proxy_over(&upstream, Some(Duration::ZERO));
    let app = registry.router();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v2/app/blobs/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, blob);
        await_cached(&storage, &digest).await;
    }
}

#[tokio::test]
async fn manifest_tags_check_upstream_every_time() {
    let upstream = MockServer::start().await;
    let manifest = br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec();
    let digest = sha256_of(&manifest);

    Mock::given(method("GET"))
        .and(path("/v2/app/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest.clone())
                .insert_header(
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v2+json",
                ),
        )
        .expect(2)
        .mount(&upstream)
        .await;

    let (_dir, storage, registry) = proxy_over(&upstream, None);
    let app = registry.router();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v2/app/manifests/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
            digest
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap(),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(body_bytes(response).await, manifest);
    }

    // The manifest body was cached under its digest.
    assert!(storage.get_meta(&digest).await.is_ok());
}

#[tokio::test]
async fn manifest_digest_references_are_served_cache_first() {
    let upstream = MockServer::start().await;
    let manifest = br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec();
    let digest = sha256_of(&manifest);

    // One upstream fetch via the tag fills the cache.
    Mock::given(method("GET"))
        .and(path("/v2/app/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.clone()))
        .expect(1)
        .mount(&upstream)
        .await;
    // The by-digest path must never be fetched upstream.
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/manifests/{digest}")))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&upstream)
        .await;

    let (_dir, _storage, registry) = proxy_over(&upstream, None);
    let app = registry.router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/app/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/app/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, manifest);
}

#[tokio::test]
async fn head_manifest_reports_upstream_size_and_type() {
    let upstream = MockServer::start().await;
    let manifest = br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec();
    let digest = sha256_of(&manifest);

    Mock::given(method("HEAD"))
        .and(path("/v2/app/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest.clone())
                .insert_header(
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .insert_header("docker-content-digest", digest.as_str()),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let (_dir, _storage, registry) = proxy_over(&upstream, None);
    let response = registry
        .router()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri("/v2/app/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap(),
        "application/vnd.docker.distribution.manifest.v2+json"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        manifest.len().to_string()
    );
}

#[tokio::test]
async fn head_manifest_by_digest_is_served_from_cache() {
    let upstream = MockServer::start().await;
    let manifest = br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec();
    let digest = sha256_of(&manifest);

    // One tag fetch fills the cache; the by-digest HEAD never goes
    // upstream.
    Mock::given(method("GET"))
        .and(path("/v2/app/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.clone()))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/app/manifests/{digest}")))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&upstream)
        .await;

    let (_dir, _storage, registry) = proxy_over(&upstream, None);
    let app = registry.router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/app/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/app/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        manifest.len().to_string()
    );
}

#[tokio::test]
async fn upstream_failure_maps_to_internal_error() {
    let upstream = MockServer::start().await;
    let digest = sha256_of(b"whatever");

    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&upstream)
        .await;

    let (_dir, _storage, registry) = proxy_over(&upstream, None);
    let response = registry
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/v2/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["code"], "INTERNAL_ERROR");
    assert!(body["detail"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn head_blob_prefers_cache_then_upstream() {
    let upstream = MockServer::start().await;
    let blob = b"headable".to_vec();
    let digest = sha256_of(&blob);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
        .mount(&upstream)
        .await;

    let (_dir, storage, registry) = proxy_over(&upstream, None);
    let app = registry.router();

    // Cold: answered by the upstream HEAD.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Warm the cache, then HEAD again: no further upstream HEAD.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v2/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    body_bytes(response).await;
    await_cached(&storage, &digest).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        blob.len().to_string()
    );

    // Pushing anything to the proxy is refused.
    let (_dir2, _storage2, registry2) = proxy_over(&upstream, None);
    let response = registry2
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v2/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
