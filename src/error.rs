use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// The full error taxonomy the control plane can surface. Every layer above the driver
/// adapter propagates one of these unchanged; the driver adapter is the only place that
/// translates a transport-level failure into a domain kind.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("no xpath cached for encoded id: {0}")]
    NoXPathForEncodedId(String),

    #[error("xpath map not cached for page: {0}")]
    XPathMapNotCached(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("dialog not fired within settle window")]
    DialogNotFired,

    #[error("driver gone: {0}")]
    DriverGone(String),

    #[error("accessibility extraction failed: {0}")]
    AxExtractionFailed(String),

    #[error("recording not found: {0}")]
    RecordingNotFound(String),

    #[error("filesystem error: {0}")]
    FilesystemError(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_)
            | ServiceError::UnsupportedMethod(_)
            | ServiceError::InvalidSelector(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::PageNotFound(_) | ServiceError::RecordingNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ServiceError::ElementNotFound(_)
            | ServiceError::NoXPathForEncodedId(_)
            | ServiceError::XPathMapNotCached(_)
            | ServiceError::DialogNotFired => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Internal(_)
            | ServiceError::DriverGone(_)
            | ServiceError::FilesystemError(_)
            | ServiceError::AxExtractionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::FilesystemError(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Internal(format!("json error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for ServiceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ServiceError::Timeout("operation exceeded its deadline".to_string())
    }
}
