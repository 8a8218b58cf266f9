//! Pipeline failures and the JSON error responses they turn into.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::extractor::{ExtractorError, ExtractorErrorKind};

const LOCAL_TOOL_ADVICE: &str =
    "Try again later, or download the video on your own machine with a tool such as yt-dlp.";

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Missing or malformed source URL.
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    ExtractionFailure(ExtractorError),
    /// 401/403, or a manifest served where a file was expected.
    #[error("upstream refused the direct link: {0}")]
    UpstreamRejected(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// An HTML page (or other non-media payload) served as the video.
    #[error("upstream returned invalid content: {0}")]
    InvalidUpstreamContent(String),
    #[error("no remux tool (ffmpeg) is available")]
    RemuxUnavailable,
    #[error("local download and remux failed: {reason}")]
    RemuxFailure {
        reason: String,
        upstream_status: Option<u16>,
    },
    #[error("{0}")]
    Internal(String),
}

impl DeliveryError {
    pub fn remux_failure(reason: impl Into<String>) -> Self {
        Self::RemuxFailure {
            reason: reason.into(),
            upstream_status: None,
        }
    }

    /// Whether another fallback attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemuxFailure { .. } => true,
            Self::ExtractionFailure(error) => matches!(
                error.kind,
                ExtractorErrorKind::Failed | ExtractorErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Remembers the status the direct attempt saw, unless one is already known.
    pub fn with_upstream_status(self, status: Option<u16>) -> Self {
        match self {
            Self::RemuxFailure {
                reason,
                upstream_status,
            } => Self::RemuxFailure {
                reason,
                upstream_status: upstream_status.or(status),
            },
            other => other,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, Some("INVALID_REQUEST"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, None)
    }

    fn new(status: StatusCode, message: impl Into<String>, code: Option<&'static str>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            retry_after_seconds: None,
        }
    }

    fn forbidden_upstream(status: StatusCode, code: &'static str) -> Self {
        Self {
            status,
            message: format!("The video source refused access. {LOCAL_TOOL_ADVICE}"),
            code: Some(code),
            retry_after_seconds: Some(60),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(error: DeliveryError) -> Self {
        match error {
            DeliveryError::InvalidRequest(message) => Self::bad_request(message),
            DeliveryError::ExtractionFailure(error) if error.is_forbidden() => {
                Self::forbidden_upstream(StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_FORBIDDEN")
            }
            DeliveryError::ExtractionFailure(error) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.message,
                Some("EXTRACTION_FAILED"),
            ),
            DeliveryError::UpstreamRejected(_) => {
                Self::forbidden_upstream(StatusCode::BAD_GATEWAY, "UPSTREAM_REJECTED")
            }
            error @ DeliveryError::UpstreamUnavailable(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                error.to_string(),
                Some("UPSTREAM_UNAVAILABLE"),
            ),
            error @ DeliveryError::InvalidUpstreamContent(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                error.to_string(),
                Some("INVALID_UPSTREAM_CONTENT"),
            ),
            DeliveryError::RemuxUnavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "This video has to be merged from separate video and audio streams, but \
                 ffmpeg is not installed on the server. Download it locally with a tool \
                 such as yt-dlp instead.",
                Some("REMUX_UNAVAILABLE"),
            ),
            DeliveryError::RemuxFailure {
                upstream_status: Some(401 | 403),
                ..
            } => Self::forbidden_upstream(StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_FORBIDDEN"),
            error @ DeliveryError::RemuxFailure { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
                Some("REMUX_FAILED"),
            ),
            DeliveryError::Internal(message) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
