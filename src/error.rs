use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Failures the gateway pipeline can name. Mapped to HTTP only at the
/// boundary through [`AppError`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("authorization header is missing")]
    AuthMissing,
    #[error("invalid credentials: {0}")]
    InvalidCredential(String),
    #[error("{0}")]
    RateLimitExceeded(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::InvalidCredential(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing => "authorization_missing",
            Self::InvalidCredential(_) => "invalid_credentials",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    /// Logged for 5xx responses, never rendered.
    pub detail: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        let code = err.code();
        match err {
            GatewayError::Internal(detail) => {
                AppError::new(status, code, "internal error").with_detail(detail)
            }
            GatewayError::UpstreamUnavailable(detail) => {
                AppError::new(status, code, "upstream provider is unavailable").with_detail(detail)
            }
            GatewayError::UpstreamTimeout(detail) => {
                AppError::new(status, code, "upstream provider timed out").with_detail(detail)
            }
            other => AppError::new(status, code, other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = self.status.as_u16(),
                code = %self.code,
                message = %self.message,
                detail = ?self.detail,
                "request failed"
            );
        } else {
            tracing::warn!(
                status = self.status.as_u16(),
                code = %self.code,
                message = %self.message,
                "request rejected"
            );
        }
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status() {
        assert_eq!(GatewayError::AuthMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::invalid_credential("x").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::RateLimitExceeded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::NotFound("user".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_rendered() {
        let err: AppError = GatewayError::internal("sqlite is on fire").into();
        assert_eq!(err.message, "internal error");
        assert_eq!(err.detail.as_deref(), Some("sqlite is on fire"));
    }
}
