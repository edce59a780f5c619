use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors produced by the resilience layer itself.
///
/// Failures of wrapped downstream operations are never converted into this
/// type; they travel inside [`crate::circuit_breaker::CircuitBreakerError`].
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Circuit breaker OPEN for {0}")]
    CircuitOpen(String),

    #[error("Rate limit exceeded, window resets at {reset_time}")]
    RateLimitExceeded { reset_time: u64, retry_after: u64 },

    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for GuardError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            GuardError::StoreUnavailable(err.to_string())
        } else {
            GuardError::Store(err.to_string())
        }
    }
}

impl From<validator::ValidationErrors> for GuardError {
    fn from(err: validator::ValidationErrors) -> Self {
        GuardError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_guard_error(err: &GuardError) -> Self {
        let message = err.to_string();
        match err {
            GuardError::CircuitOpen(_) => Self::new("service_unavailable", &message, 503),
            GuardError::RateLimitExceeded { .. } => Self::new("rate_limit_exceeded", &message, 429),
            GuardError::StoreUnavailable(_) => Self::new("service_unavailable", &message, 503),
            GuardError::Store(_) => Self::new("internal_error", &message, 500),
            GuardError::Serialization(_) => Self::new("internal_error", &message, 500),
            GuardError::Validation(_) => Self::new("validation_error", &message, 422),
            GuardError::NotFound(_) => Self::new("not_found", &message, 404),
            GuardError::Configuration(_) => Self::new("configuration_error", &message, 500),
            GuardError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_guard_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = (status, Json(body)).into_response();
        if let GuardError::RateLimitExceeded { retry_after, .. } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_message_format() {
        let err = GuardError::CircuitOpen("billing-api".to_string());
        assert_eq!(err.to_string(), "Circuit breaker OPEN for billing-api");
    }

    #[test]
    fn test_status_mapping() {
        let open = ErrorResponse::from_guard_error(&GuardError::CircuitOpen("db".into()));
        assert_eq!(open.code, 503);

        let limited = ErrorResponse::from_guard_error(&GuardError::RateLimitExceeded {
            reset_time: 120,
            retry_after: 30,
        });
        assert_eq!(limited.code, 429);
        assert_eq!(limited.error, "rate_limit_exceeded");

        let invalid = ErrorResponse::from_guard_error(&GuardError::Validation("bad".into()));
        assert_eq!(invalid.code, 422);

        let missing = ErrorResponse::from_guard_error(&GuardError::NotFound("circuit".into()));
        assert_eq!(missing.code, 404);
    }

    #[test]
    fn test_rate_limit_response_carries_retry_after() {
        let response = GuardError::RateLimitExceeded {
            reset_time: 120,
            retry_after: 30,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }
}
