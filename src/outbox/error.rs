//! Outbox Errors
//!
//! Error types for outbox store operations.

use uuid::Uuid;

use super::OutboxStatus;

/// Errors that can occur in the outbox store
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Record not found
    #[error("Outbox record not found: {0}")]
    NotFound(Uuid),

    /// Transition attempted from a terminal status
    #[error("Invalid outbox transition for {id}: record is {status}")]
    InvalidTransition { id: Uuid, status: OutboxStatus },

    /// Store unreachable or query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row could not be decoded into a record
    #[error("Invalid outbox record: {0}")]
    InvalidRecord(String),
}

impl OutboxError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutboxError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_error_is_retryable() {
        let transition = OutboxError::InvalidTransition {
            id: Uuid::new_v4(),
            status: OutboxStatus::Published,
        };
        assert!(!transition.is_retryable());
        assert!(transition.to_string().contains("PUBLISHED"));

        let db = OutboxError::Database(sqlx::Error::PoolTimedOut);
        assert!(db.is_retryable());
    }
}
