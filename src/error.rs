//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::repository::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing authenticated identity")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Authorization store unavailable; treated as deny
    #[error("Authorization could not be determined")]
    AuthorizationIndeterminate,

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    // Domain errors
    #[error(transparent)]
    Domain(#[from] crate::domain::DomainError),

    // Server errors (5xx)
    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, key } => AppError::NotFound { entity, key },
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            other => AppError::Store(other),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }

            // 401 Unauthorized
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated", None),

            // 403 Forbidden
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.clone())),
            AppError::AuthorizationIndeterminate => {
                (StatusCode::FORBIDDEN, "authorization_indeterminate", None)
            }

            // 404 Not Found
            AppError::NotFound { key, .. } => (StatusCode::NOT_FOUND, "not_found", Some(key.clone())),

            // 409 Conflict
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg.clone())),

            // Domain errors - map to appropriate HTTP status
            AppError::Domain(ref domain_err) => {
                use crate::domain::DomainError;
                match domain_err {
                    DomainError::NotFound { key, .. } => {
                        (StatusCode::NOT_FOUND, "not_found", Some(key.clone()))
                    }
                    DomainError::Conflict(msg) => {
                        (StatusCode::CONFLICT, "conflict", Some(msg.clone()))
                    }
                    DomainError::SystemRoleImmutable(code) => {
                        (StatusCode::CONFLICT, "system_role_immutable", Some(code.clone()))
                    }
                    DomainError::InvalidPermissionCode(code) => {
                        (StatusCode::BAD_REQUEST, "invalid_permission_code", Some(code.clone()))
                    }
                    DomainError::InvalidGrantPattern(pattern) => {
                        (StatusCode::BAD_REQUEST, "invalid_grant_pattern", Some(pattern.clone()))
                    }
                    DomainError::Validation(msg) => {
                        (StatusCode::BAD_REQUEST, "validation_failed", Some(msg.clone()))
                    }
                }
            }

            // 500 Internal Server Error
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error", None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AppError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (AppError::AuthorizationIndeterminate, StatusCode::FORBIDDEN),
            (AppError::Conflict("dup".into()), StatusCode::CONFLICT),
            (
                AppError::Domain(DomainError::InvalidGrantPattern("*".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Domain(DomainError::SystemRoleImmutable("viewer".into())),
                StatusCode::CONFLICT,
            ),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_store_error_conversion() {
        let not_found: AppError = StoreError::not_found("role", "viewer").into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let conflict: AppError = StoreError::Conflict("dup".into()).into();
        assert!(matches!(conflict, AppError::Conflict(_)));

        let unavailable: AppError = StoreError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(
            unavailable.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
