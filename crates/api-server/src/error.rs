//! Structured API error handling
//!
//! Every engine failure crosses the HTTP boundary as the engine's
//! `{ category, detail, session_id? }` report with a mapped status code;
//! nothing internal leaks as a raw panic or opaque 500.

use access_engine::{EngineError, ErrorCategory, ErrorReport};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// HTTP-facing error: an engine report plus its status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub report: ErrorReport,
}

impl ApiError {
    pub fn new(status: StatusCode, category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self {
            status,
            report: ErrorReport {
                category,
                detail: detail.into(),
                session_id: None,
            },
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCategory::InvalidInput, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCategory::PolicyDenied, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCategory::PolicyDenied,
            detail,
        )
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err.category() {
            ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCategory::PolicyDenied => StatusCode::FORBIDDEN,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::AlreadyTerminated | ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::EnforcerFailed => StatusCode::BAD_GATEWAY,
            ErrorCategory::Inconsistent => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            report: err.report(None),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.report)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status_mapping() {
        let err: ApiError = EngineError::InvalidInput("bad".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = EngineError::NotFound("gone".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = EngineError::EnforcerTransient("timeout".into()).into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);

        let err: ApiError = EngineError::AlreadyTerminated("s".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
