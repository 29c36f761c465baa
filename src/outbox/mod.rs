//! Outbox module
//!
//! Transactional outbox: publish intents appended in the same transaction as
//! the RBAC mutation they describe, later drained by the relay.

mod error;
mod postgres;
mod record;

pub use error::OutboxError;
pub use postgres::PgOutboxStore;
pub use record::{NewOutboxRecord, OutboxMessage, OutboxRecord, OutboxStatus};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Relay-facing outbox operations.
///
/// Appends are not part of this trait; they take the caller's open
/// transaction on the concrete store (see [`PgOutboxStore::append`]).
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Not-yet-published records (PENDING or FAILED), oldest first
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Lease up to `limit` deliverable records for `relay_id`.
    ///
    /// Records already leased by another relay, and records whose older
    /// same-aggregate sibling is leased, are skipped.
    async fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Drop a lease without recording an attempt
    async fn release(&self, id: Uuid) -> Result<(), OutboxError>;

    async fn mark_published(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError>;

    /// Increment attempts and record the failure; returns the new attempt count
    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        when: DateTime<Utc>,
    ) -> Result<i32, OutboxError>;

    async fn mark_dead_lettered(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError>;
}

/// In-process change notification: writers ping it after committing an
/// outbox append, the relay wakes up instead of waiting for its next tick.
#[derive(Debug, Clone, Default)]
pub struct OutboxSignal {
    notify: Arc<Notify>,
}

impl OutboxSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_wakes_waiter_even_if_sent_first() {
        let signal = OutboxSignal::new();
        signal.notify();

        // notify_one stores a permit when nobody is waiting yet
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.notified())
            .await
            .expect("stored permit should complete the wait");
    }
}
