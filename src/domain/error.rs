//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;

/// Domain-specific errors
///
/// These errors represent RBAC rule violations and invariant failures.
/// They are independent of the web/infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Referenced entity does not exist
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Duplicate tenant-scoped code, duplicate assignment, etc.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Permission code is not a dotted `module.action` code
    #[error("Invalid permission code: {0}")]
    InvalidPermissionCode(String),

    /// Grant pattern is neither a concrete code nor a `prefix.*` wildcard
    #[error("Invalid grant pattern: {0}")]
    InvalidGrantPattern(String),

    /// System roles are seeded per tenant and cannot be removed
    #[error("System role cannot be deleted: {0}")]
    SystemRoleImmutable(String),

    /// Generic input validation failure
    #[error("Validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    /// Create a not found error
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPermissionCode(_)
                | Self::InvalidGrantPattern(_)
                | Self::Validation(_)
                | Self::NotFound { .. }
        )
    }

    /// Check if this is a conflict error
    pub fn is_conflict_error(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::SystemRoleImmutable(_))
    }
}
