//! Registry error type and its OCI wire mapping.
//!
//! Every failed request carries a JSON body `{code, message, detail?}`
//! with a stable error code; the code decides the HTTP status.

use artifact_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Repository name not known to the registry.
    #[error("repository name not known to registry")]
    NameUnknown { name: String },

    /// Blob not present under the digest.
    #[error("blob unknown to registry")]
    BlobUnknown { digest: String },

    /// No manifest for the tag or digest.
    #[error("manifest unknown")]
    ManifestUnknown { reference: String },

    /// No upload session for the uuid.
    #[error("blob upload unknown to registry")]
    UploadUnknown { uuid: String },

    /// Malformed or rejected blob upload.
    #[error("blob upload invalid")]
    UploadInvalid { detail: String },

    /// Malformed or rejected manifest.
    #[error("manifest invalid")]
    ManifestInvalid { detail: String },

    /// Computed content digest disagrees with the declared digest.
    #[error("digest mismatch")]
    DigestMismatch { expected: String, actual: String },

    /// Requested range cannot be satisfied.
    #[error("requested range not satisfiable")]
    RangeInvalid { detail: String },

    /// Method or operation outside the supported subset.
    #[error("the operation is unsupported")]
    Unsupported,

    /// Authentication required.
    #[error("authentication required")]
    Unauthorized { detail: String },

    /// Access denied.
    #[error("requested access to the resource is denied")]
    Denied { detail: String },

    /// Non-2xx or transport failure talking to the proxied upstream.
    #[error("upstream registry error")]
    Upstream { status: Option<u16>, detail: String },

    /// Alias is not a valid RFC-1123 DNS name.
    #[error("invalid DNS name for alias: {0}")]
    InvalidAlias(String),

    /// Alias is already registered.
    #[error("registry alias already exists: {0}")]
    AliasExists(String),

    /// No registry registered under the alias.
    #[error("registry alias not found: {0}")]
    UnknownAlias(String),

    /// No factory registered for the class name.
    #[error("registry class not found: {0}")]
    UnknownClass(String),

    /// The configuration tree for a registry is incomplete or malformed.
    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),

    /// A storage error that no surface-specific mapping applied to.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Everything else.
    #[error("internal registry error")]
    Internal { detail: String },
}

impl RegistryError {
    pub fn internal(detail: impl Into<String>) -> Self {
        RegistryError::Internal {
            detail: detail.into(),
        }
    }

    /// The stable OCI error code.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NameUnknown { .. } => "NAME_UNKNOWN",
            RegistryError::BlobUnknown { .. } => "BLOB_UNKNOWN",
            RegistryError::ManifestUnknown { .. } => "MANIFEST_UNKNOWN",
            RegistryError::UploadUnknown { .. } => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::UploadInvalid { .. } | RegistryError::DigestMismatch { .. } => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::ManifestInvalid { .. } => "MANIFEST_INVALID",
            RegistryError::RangeInvalid { .. } => "RANGE_INVALID",
            RegistryError::Unsupported => "UNSUPPORTED",
            RegistryError::Unauthorized { .. } => "UNAUTHORIZED",
            RegistryError::Denied { .. } => "DENIED",
            RegistryError::Store(err) => match err {
                StoreError::NotFound { .. } => "BLOB_UNKNOWN",
                StoreError::HashConflict { .. } => "BLOB_UPLOAD_INVALID",
                _ => "INTERNAL_ERROR",
            },
            _ => "INTERNAL_ERROR",
        }
    }

    /// The HTTP status mapped from the error code.
    pub fn status(&self) -> StatusCode {
        match self.code() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "DENIED" => StatusCode::FORBIDDEN,
            "NAME_UNKNOWN" | "BLOB_UNKNOWN" | "MANIFEST_UNKNOWN" | "BLOB_UPLOAD_UNKNOWN" => {
                StatusCode::NOT_FOUND
            }
            "BLOB_UPLOAD_INVALID" | "MANIFEST_INVALID" => StatusCode::BAD_REQUEST,
            "RANGE_INVALID" => StatusCode::RANGE_NOT_SATISFIABLE,
            "UNSUPPORTED" => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            RegistryError::NameUnknown { name } => Some(format!("name: {name}")),
            RegistryError::BlobUnknown { digest } => Some(format!("digest: {digest}")),
            RegistryError::ManifestUnknown { reference } => {
                Some(format!("reference: {reference}"))
            }
            RegistryError::UploadUnknown { uuid } => Some(format!("uuid: {uuid}")),
            RegistryError::UploadInvalid { detail }
            | RegistryError::ManifestInvalid { detail }
            | RegistryError::RangeInvalid { detail }
            | RegistryError::Unauthorized { detail }
            | RegistryError::Denied { detail }
            | RegistryError::Internal { detail } => Some(detail.clone()),
            RegistryError::DigestMismatch { expected, actual } => {
                Some(format!("expected {expected}, got {actual}"))
            }
            RegistryError::Upstream { status, detail } => Some(match status {
                Some(status) => format!("upstream status {status}: {detail}"),
                None => detail.clone(),
            }),
            RegistryError::Unsupported => None,
            RegistryError::InvalidAlias(_)
            | RegistryError::AliasExists(_)
            | RegistryError::UnknownAlias(_)
            | RegistryError::UnknownClass(_)
            | RegistryError::InvalidConfig(_) => None,
            RegistryError::Store(err) => Some(err.to_string()),
        }
    }
}

/// Wire format of an error response.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, detail = ?self.detail(), "registry request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}
