//! Store Errors
//!
//! Error types for RBAC and directory persistence.

use crate::outbox::OutboxError;

/// Errors that can occur in the RBAC and directory stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row not found
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Unique constraint or state conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Stored value could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Outbox append failed inside the mutation's transaction
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Store could not be reached or the query failed mid-flight
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Database(_) => true,
            StoreError::Outbox(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            if db_error.is_unique_violation() {
                return StoreError::Conflict(db_error.message().to_string());
            }
        }
        StoreError::Database(error)
    }
}
