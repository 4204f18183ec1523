//! HTTP surface of the proxy registry: the read-only half of the
//! Distribution API. Push operations are not proxied.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;

use crate::headers::{API_VERSION, API_VERSION_HEADER, DOCKER_CONTENT_DIGEST};
use crate::path::{parse_v2_path, V2Route};
use crate::{RegistryError, RegistryResult};

use super::ProxyRegistry;

pub(crate) fn router(registry: ProxyRegistry) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route(
            "/v2/*path",
            get(handle_get)
                .head(handle_head)
                .post(|| async { RegistryError::Unsupported })
                .put(|| async { RegistryError::Unsupported })
                .patch(|| async { RegistryError::Unsupported })
                .delete(|| async { RegistryError::Unsupported }),
        )
        .with_state(registry)
}

async fn api_version() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)])
}

async fn handle_get(
    State(registry): State<ProxyRegistry>,
    Path(path): Path<String>,
) -> RegistryResult<Response> {
    match parse_v2_path(&path) {
        Some(V2Route::Manifest { name, reference }) => {
            let (data, media_type, digest) = registry.get_manifest(&name, &reference).await?;
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE.as_str(), media_type),
                    (header::CONTENT_LENGTH.as_str(), data.len().to_string()),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
                data,
            )
                .into_response())
        }
        Some(V2Route::Blob { name, digest }) => {
            let (reader, length) = registry.get_blob(&name, &digest).await?;
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(DOCKER_CONTENT_DIGEST, digest);
            if length >= 0 {
                response = response.header(header::CONTENT_LENGTH, length.to_string());
            }
            response
                .body(Body::from_stream(ReaderStream::new(reader)))
                .map_err(|err| RegistryError::internal(err.to_string()))
        }
        _ => Err(RegistryError::NameUnknown { name: path }),
    }
}

async fn handle_head(
    State(registry): State<ProxyRegistry>,
    Path(path): Path<String>,
) -> RegistryResult<Response> {
    match parse_v2_path(&path) {
        Some(V2Route::Manifest { name, reference }) => {
            let (digest, length, media_type) = registry
                .head_manifest(&name, &reference)
                .await?
                .ok_or(RegistryError::ManifestUnknown {
                    reference: reference.clone(),
                })?;
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, media_type)
                .header(DOCKER_CONTENT_DIGEST, digest);
            if length >= 0 {
                response = response.header(header::CONTENT_LENGTH, length.to_string());
            }
            response
                .body(Body::empty())
                .map_err(|err| RegistryError::internal(err.to_string()))
        }
        Some(V2Route::Blob { name, digest }) => {
            let length =
                registry
                    .head_blob(&name, &digest)
                    .await?
                    .ok_or(RegistryError::BlobUnknown {
                        digest: digest.clone(),
                    })?;
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(DOCKER_CONTENT_DIGEST, digest);
            if length >= 0 {
                response = response.header(header::CONTENT_LENGTH, length.to_string());
            }
            response
                .body(Body::empty())
                .map_err(|err| RegistryError::internal(err.to_string()))
        }
        _ => Err(RegistryError::NameUnknown { name: path }),
    }
}
