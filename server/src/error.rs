//! Gateway error taxonomy and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Which rate-limit layer denied a request. The first matching layer wins
/// and its code is surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitCategory {
    IpOverride,
    UserOverride,
    SystemDefault,
    IpDailyLimit,
    UserDailyLimit,
}

impl RateLimitCategory {
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitCategory::IpOverride => "IP_RATE_LIMIT_EXCEEDED",
            RateLimitCategory::UserOverride => "USER_RATE_LIMIT_EXCEEDED",
            RateLimitCategory::SystemDefault => "SYSTEM_RATE_LIMIT_EXCEEDED",
            RateLimitCategory::IpDailyLimit => "IP_DAILY_LIMIT_EXCEEDED",
            RateLimitCategory::UserDailyLimit => "USER_DAILY_LIMIT_EXCEEDED",
        }
    }
}

/// Errors surfaced on the request path. Each maps to exactly one HTTP
/// status and a machine-readable code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("user is disabled")]
    UserDisabled,

    #[error("IP address is blocked")]
    IpBlocked,

    #[error("rate limit exceeded")]
    RateLimited(RateLimitCategory),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("no eligible upstream account")]
    NoAccount,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("all upstream attempts failed: {0}")]
    UpstreamExhausted(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::UserDisabled | GatewayError::IpBlocked => StatusCode::FORBIDDEN,
            GatewayError::RateLimited(_) | GatewayError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::NoAccount => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamExhausted(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingApiKey => "MISSING_API_KEY",
            GatewayError::InvalidApiKey => "INVALID_API_KEY",
            GatewayError::UserDisabled => "USER_DISABLED",
            GatewayError::IpBlocked => "IP_BLOCKED",
            GatewayError::RateLimited(category) => category.code(),
            GatewayError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            GatewayError::NoAccount => "NO_AVAILABLE_ACCOUNT",
            GatewayError::BadRequest(_) => "INVALID_REQUEST",
            GatewayError::UpstreamExhausted(_) => "UPSTREAM_FAILED",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal detail stays out of the client body.
        let message = match &self {
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        if let GatewayError::Internal(err) = &self {
            tracing::error!(error = ?err, "request failed with internal error");
        }
        let body = Json(json!({
            "error": {
                "type": "api_error",
                "code": self.code(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
