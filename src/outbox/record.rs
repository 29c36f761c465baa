//! Outbox records
//!
//! Publish intents co-written with the mutation they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Payload, RbacEvent};

use super::OutboxError;

/// Publication status of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    /// Last attempt failed; still eligible for retry
    Failed,
    /// Retries exhausted and parked on the dead-letter stream
    DeadLettered,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// PUBLISHED and DEAD_LETTERED never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DeadLettered)
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD_LETTERED" => Ok(OutboxStatus::DeadLettered),
            other => Err(OutboxError::InvalidRecord(format!("unknown status '{}'", other))),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record to be appended inside the caller's transaction
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxRecord {
    pub fn new(
        tenant_id: Uuid,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn from_event(event: &RbacEvent) -> Self {
        Self::new(
            event.tenant_id(),
            event.aggregate_type(),
            event.aggregate_id(),
            event.event_type(),
            event.payload(),
        )
    }
}

/// Stored outbox record
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Payload,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Insertion order; breaks created_at ties inside one transaction
    pub sequence: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn from_new(record: NewOutboxRecord, sequence: i64) -> Self {
        Self {
            id: record.id,
            tenant_id: record.tenant_id,
            aggregate_type: record.aggregate_type,
            aggregate_id: record.aggregate_id,
            event_type: record.event_type,
            payload: record.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            published_at: None,
            error_message: None,
            created_at: record.created_at,
            sequence,
            locked_by: None,
            locked_until: None,
        }
    }

    /// Not yet published and not parked
    pub fn is_deliverable(&self) -> bool {
        matches!(self.status, OutboxStatus::Pending | OutboxStatus::Failed)
    }

    pub fn is_leased_at(&self, at: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until >= at)
    }

    /// Ordering key within an aggregate
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.sequence)
    }

    /// Build the bus message for this record
    pub fn to_message(&self) -> OutboxMessage {
        OutboxMessage {
            event_id: self.id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            tenant_id: self.tenant_id,
            payload: self.payload.clone(),
            occurred_at: self.created_at,
        }
    }
}

/// Wire message published for one outbox record.
///
/// `event_id` is stable across redeliveries so consumers can deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub tenant_id: Uuid,
    pub payload: Payload,
    pub occurred_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, OutboxError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, OutboxError> {
        Ok(serde_json::from_slice(data)?)
    }
}
