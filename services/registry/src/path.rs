//! `/v2/` path dispatch.
//!
//! Repository names may span multiple path segments (`lib/alpine`), so
//! the routes cannot be expressed with single-segment captures. The
//! dispatcher splits on the fixed `/manifests/`, `/blobs/` and
//! `/blobs/uploads/` markers instead, with the name being everything
//! before the marker.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum V2Route {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    UploadStart { name: String },
    Upload { name: String, uuid: String },
}

/// Parses the remainder of a `/v2/...` request path (without the `/v2/`
/// prefix and without a query string).
pub(crate) fn parse_v2_path(rest: &str) -> Option<V2Route> {
    // `/blobs/uploads/` first: `/blobs/` is a prefix of it.
    if let Some((name, tail)) = rest.split_once("/blobs/uploads/") {
        if name.is_empty() {
            return None;
        }
        return Some(if tail.is_empty() {
            V2Route::UploadStart {
                name: name.to_string(),
            }
        } else {
            V2Route::Upload {
                name: name.to_string(),
                uuid: tail.to_string(),
            }
        });
    }

    if let Some((name, reference)) = rest.split_once("/manifests/") {
        if name.is_empty() || reference.is_empty() {
            return None;
        }
        return Some(V2Route::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }

    if let Some((name, digest)) = rest.split_once("/blobs/") {
        if name.is_empty() || digest.is_empty() {
            return None;
        }
        return Some(V2Route::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }

    None
}
