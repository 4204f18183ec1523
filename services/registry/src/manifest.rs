//! Manifest media types.
//!
//! Manifests are stored as opaque blobs; the media type reported on reads
//! is recovered from the document itself (explicit `mediaType` field, or
//! the schema version shape for older Docker manifests).

use crate::{RegistryError, RegistryResult};

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Recovers the media type from manifest content. Defaults to the OCI
/// manifest type when the document gives no better answer.
pub fn detect_media_type(data: &[u8]) -> String {
    let Ok(document) = serde_json::from_slice::<serde_json::Value>(data) else {
        return MEDIA_TYPE_OCI_MANIFEST.to_string();
    };

    if let Some(media_type) = document.get("mediaType").and_then(|v| v.as_str()) {
        return media_type.to_string();
    }

    match document.get("schemaVersion").and_then(|v| v.as_u64()) {
        Some(1) => MEDIA_TYPE_DOCKER_MANIFEST_V1.to_string(),
        Some(2) if document.get("manifests").is_some() => {
            MEDIA_TYPE_DOCKER_MANIFEST_LIST.to_string()
        }
        Some(2) => MEDIA_TYPE_DOCKER_MANIFEST.to_string(),
        _ => MEDIA_TYPE_OCI_MANIFEST.to_string(),
    }
}

/// Accepts only recognised manifest media types on upload.
pub fn validate_media_type(content_type: &str) -> RegistryResult<()> {
    match content_type {
        MEDIA_TYPE_DOCKER_MANIFEST
        | MEDIA_TYPE_DOCKER_MANIFEST_LIST
        | MEDIA_TYPE_DOCKER_MANIFEST_V1
        | MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED
        | MEDIA_TYPE_OCI_MANIFEST
        | MEDIA_TYPE_OCI_INDEX => Ok(()),
        other => Err(RegistryError::ManifestInvalid {
            detail: format!("unsupported manifest media type: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_media_type_wins() {
        let doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
        });
        assert_eq!(
            detect_media_type(&serde_json::to_vec(&doc).unwrap()),
            MEDIA_TYPE_OCI_INDEX
        );
    }

    #[test]
    fn schema_version_shapes() {
        let v1 = serde_json::json!({"schemaVersion": 1});
        assert_eq!(
            detect_media_type(&serde_json::to_vec(&v1).unwrap()),
            MEDIA_TYPE_DOCKER_MANIFEST_V1
        );

        let v2 = serde_json::json!({"schemaVersion": 2, "config": {}});
        assert_eq!(
            detect_media_type(&serde_json::to_vec(&v2).unwrap()),
            MEDIA_TYPE_DOCKER_MANIFEST
        );

        let list = serde_json::json!({"schemaVersion": 2, "manifests": []});
        assert_eq!(
            detect_media_type(&serde_json::to_vec(&list).unwrap()),
            MEDIA_TYPE_DOCKER_MANIFEST_LIST
        );
    }

    #[test]
    fn garbage_defaults_to_oci() {
        assert_eq!(detect_media_type(b"not json"), MEDIA_TYPE_OCI_MANIFEST);
    }

    #[test]
    fn upload_type_validation() {
        assert!(validate_media_type(MEDIA_TYPE_DOCKER_MANIFEST).is_ok());
        assert!(validate_media_type("text/plain").is_err());
    }
}
