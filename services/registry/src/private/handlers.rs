//! HTTP surface of the private registry.
//!
//! Routes are dispatched through [`parse_v2_path`] rather than per-route
//! captures so repository names may span multiple path segments.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use crate::headers::{
    API_VERSION, API_VERSION_HEADER, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID,
};
use crate::path::{parse_v2_path, V2Route};
use crate::{manifest, RegistryError, RegistryResult};

use super::PrivateRegistry;

pub(crate) fn router(registry: PrivateRegistry) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route(
            "/v2/*path",
            get(handle_get)
                .head(handle_head)
                .post(handle_post)
                .put(handle_put)
                .patch(handle_patch)
                .delete(|| async { RegistryError::Unsupported }),
        )
        .with_state(registry)
}

/// GET /v2/ version probe.
async fn api_version() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)])
}

#[derive(Debug, serde::Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

async fn handle_get(
    State(registry): State<PrivateRegistry>,
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
        Some(V2Route::Blob { digest, .. }) => {
            let (reader, length) = registry.get_blob(&digest).await?;
            Ok((
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE.as_str(),
                        "application/octet-stream".to_string(),
                    ),
                    (header::CONTENT_LENGTH.as_str(), length.to_string()),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
                Body::from_stream(ReaderStream::new(reader)),
            )
                .into_response())
        }
        _ => Err(RegistryError::NameUnknown { name: path }),
    }
}

async fn handle_head(
    State(registry): State<PrivateRegistry>,
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
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE.as_str(), media_type),
                    (header::CONTENT_LENGTH.as_str(), length.to_string()),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
            )
                .into_response())
        }
        Some(V2Route::Blob { digest, .. }) => {
            let length = registry
                .head_blob(&digest)
                .await?
                .ok_or(RegistryError::BlobUnknown {
                    digest: digest.clone(),
                })?;
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_LENGTH.as_str(), length.to_string()),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
            )
                .into_response())
        }
        _ => Err(RegistryError::NameUnknown { name: path }),
    }
}

/// POST /v2/{name}/blobs/uploads/: opens a session, or stores directly
/// when the digest is supplied up front.
async fn handle_post(
    State(registry): State<PrivateRegistry>,
    Path(path): Path<String>,
    Query(query): Query<DigestQuery>,
    body: Body,
) -> RegistryResult<Response> {
    let Some(V2Route::UploadStart { name }) = parse_v2_path(&path) else {
        return Err(RegistryError::NameUnknown { name: path });
    };

    if let Some(digest) = query.digest {
        validate_digest(&digest)?;
        let stream = body.into_data_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        registry.put_blob(&name, &digest, &mut reader, -1).await?;
        return Ok((
            StatusCode::CREATED,
            [
                (
                    header::LOCATION.as_str(),
                    format!("/v2/{name}/blobs/{digest}"),
                ),
                (DOCKER_CONTENT_DIGEST, digest),
            ],
        )
            .into_response());
    }

    let uuid = registry.start_upload(&name).await;
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{name}/blobs/uploads/{uuid}"),
            ),
            (header::RANGE.as_str(), "0-0".to_string()),
            (DOCKER_UPLOAD_UUID, uuid.to_string()),
        ],
    )
        .into_response())
}

/// PATCH /v2/{name}/blobs/uploads/{uuid}: appends a chunk.
async fn handle_patch(
    State(registry): State<PrivateRegistry>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let Some(V2Route::Upload { name, uuid }) = parse_v2_path(&path) else {
        return Err(RegistryError::NameUnknown { name: path });
    };
    let uuid = parse_session_uuid(&uuid)?;
    let offset = content_range_offset(&headers);

    let new_offset = registry.upload_chunk(&name, uuid, &body, offset).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [
            (
                header::RANGE.as_str(),
                format!("0-{}", (new_offset - 1).max(0)),
            ),
            (DOCKER_UPLOAD_UUID, uuid.to_string()),
        ],
    )
        .into_response())
}

async fn handle_put(
    State(registry): State<PrivateRegistry>,
    Path(path): Path<String>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    match parse_v2_path(&path) {
        Some(V2Route::Manifest { name, reference }) => {
            if let Some(content_type) = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                manifest::validate_media_type(content_type)?;
            }
            let digest = registry.put_manifest(&name, &reference, &body).await?;
            Ok((
                StatusCode::CREATED,
                [
                    (
                        header::LOCATION.as_str(),
                        format!("/v2/{name}/manifests/{reference}"),
                    ),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
            )
                .into_response())
        }
        Some(V2Route::Upload { name, uuid }) => {
            let uuid = parse_session_uuid(&uuid)?;
            let digest = query.digest.ok_or_else(|| RegistryError::UploadInvalid {
                detail: "digest query parameter required".to_string(),
            })?;
            validate_digest(&digest)?;

            registry.complete_upload(&name, uuid, &digest, &body).await?;
            Ok((
                StatusCode::CREATED,
                [
                    (
                        header::LOCATION.as_str(),
                        format!("/v2/{name}/blobs/{digest}"),
                    ),
                    (DOCKER_CONTENT_DIGEST, digest),
                ],
            )
                .into_response())
        }
        Some(V2Route::Blob { .. }) => Err(RegistryError::Unsupported),
        _ => Err(RegistryError::NameUnknown { name: path }),
    }
}

fn parse_session_uuid(raw: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| RegistryError::UploadUnknown {
        uuid: raw.to_string(),
    })
}

/// Declared digests on upload surfaces must be well-formed sha256 digests.
fn validate_digest(digest: &str) -> RegistryResult<()> {
    if crate::is_digest(digest) {
        Ok(())
    } else {
        Err(RegistryError::UploadInvalid {
            detail: format!("malformed digest: {digest}"),
        })
    }
}

/// Offset from an optional `Content-Range: bytes {start}-{end}/...`
/// header (the `bytes ` prefix itself being optional). Defaults to 0.
fn content_range_offset(headers: &HeaderMap) -> i64 {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            let raw = raw.strip_prefix("bytes ").unwrap_or(raw);
            raw.split('-').next()?.trim().parse().ok()
        })
        .unwrap_or(0)
}
