use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

/// Unified error type for the proxy pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Input errors
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Proxy already exists: {id}")]
    Duplicate { id: String },

    #[error("Proxy not found: {id}")]
    NotFound { id: String },

    // Acquire guards
    #[error("Per-minute quota of {limit} exhausted for proxy {id}")]
    QuotaExceeded { id: String, limit: i32 },

    #[error("Proxy {id} is already at its concurrency cap of {max}")]
    ConcurrencyExceeded { id: String, max: i32 },

    // Probe errors
    #[error("Connectivity check failed ({code}): {message}")]
    Connectivity { code: String, message: String },

    #[error("Connectivity check timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Backend errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        PoolError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        PoolError::NotFound { id: id.into() }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PoolError::Validation { .. } => StatusCode::BAD_REQUEST,
            PoolError::Duplicate { .. } => StatusCode::CONFLICT,
            PoolError::NotFound { .. } => StatusCode::NOT_FOUND,

            PoolError::QuotaExceeded { .. } | PoolError::ConcurrencyExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            PoolError::Connectivity { .. } => StatusCode::BAD_GATEWAY,
            PoolError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            PoolError::DatabaseConnection(_) => StatusCode::SERVICE_UNAVAILABLE,

            PoolError::InvalidConfig(_)
            | PoolError::Database(_)
            | PoolError::Io(_)
            | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &str {
        match self {
            PoolError::Validation { .. } => "VALIDATION_ERROR",
            PoolError::Duplicate { .. } => "DUPLICATE",
            PoolError::NotFound { .. } => "NOT_FOUND",
            PoolError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            PoolError::ConcurrencyExceeded { .. } => "CONCURRENCY_EXCEEDED",
            PoolError::Connectivity { code, .. } => code.as_str(),
            PoolError::Timeout { .. } => "TIMEOUT",
            PoolError::InvalidConfig(_) => "INVALID_CONFIG",
            PoolError::Database(_) | PoolError::DatabaseConnection(_) => "DATABASE_ERROR",
            PoolError::Io(_) => "IO_ERROR",
            PoolError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Acquire guard failures are meant to be retried after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::QuotaExceeded { .. } | PoolError::ConcurrencyExceeded { .. }
        )
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_server_error() {
            error!(status = status.as_u16(), code = self.code(), error = %self, "Request failed");
        } else if self.is_client_error() {
            debug!(status = status.as_u16(), code = self.code(), error = %self, "Request rejected");
        }

        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            PoolError::validation("port", "out of range").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PoolError::Duplicate { id: "x".into() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(PoolError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            PoolError::QuotaExceeded {
                id: "x".into(),
                limit: 60
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PoolError::Timeout { after_ms: 10 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            PoolError::Connectivity {
                code: "CONNECTION_FAILED".into(),
                message: "refused".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(PoolError::Timeout { after_ms: 1 }.code(), "TIMEOUT");
        assert_eq!(
            PoolError::Connectivity {
                code: "PROXY_AUTH_FAILED".into(),
                message: "407".into()
            }
            .code(),
            "PROXY_AUTH_FAILED"
        );
        assert_eq!(
            PoolError::validation("host", "bad").to_string(),
            "Invalid host: bad"
        );
    }

    #[test]
    fn test_error_retryable_and_class_helpers() {
        assert!(PoolError::ConcurrencyExceeded {
            id: "x".into(),
            max: 1
        }
        .is_retryable());
        assert!(!PoolError::not_found("x").is_retryable());

        assert!(PoolError::not_found("x").is_client_error());
        assert!(PoolError::Internal("boom".into()).is_server_error());
    }
}
