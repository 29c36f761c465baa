//! PostgreSQL outbox store
//!
//! `outbox_events` table access. Appends run on the caller's transaction;
//! relay operations run on the pool.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{NewOutboxRecord, OutboxError, OutboxRecord, OutboxRepository, OutboxStatus};

const RECORD_COLUMNS: &str = r#"
    id, tenant_id, aggregate_type, aggregate_id, event_type, payload, status,
    attempts, last_attempt_at, published_at, error_message, created_at,
    sequence, locked_by, locked_until
"#;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    tenant_id: Uuid,
    aggregate_type: String,
    aggregate_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    sequence: i64,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload.into(),
            status: row.status.parse()?,
            attempts: row.attempts,
            last_attempt_at: row.last_attempt_at,
            published_at: row.published_at,
            error_message: row.error_message,
            created_at: row.created_at,
            sequence: row.sequence,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
        })
    }
}

/// Outbox store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a new PgOutboxStore with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a record inside the caller's open transaction.
    ///
    /// Never begins or commits a transaction of its own: the record becomes
    /// visible exactly when the caller's mutation commits.
    pub async fn append(
        tx: &mut Transaction<'_, Postgres>,
        record: &NewOutboxRecord,
    ) -> Result<OutboxRecord, OutboxError> {
        let payload = serde_json::to_value(&record.payload)?;

        let row: OutboxRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO outbox_events (
                id, tenant_id, aggregate_type, aggregate_id, event_type,
                payload, status, attempts, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(&record.aggregate_type)
        .bind(record.aggregate_id)
        .bind(&record.event_type)
        .bind(payload)
        .bind(record.created_at)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!(
            record_id = %record.id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            "Outbox record appended"
        );

        row.try_into()
    }

    /// Resolve why a conditional update touched no row
    async fn transition_error(&self, id: Uuid) -> OutboxError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(Some(status)) => match status.parse::<OutboxStatus>() {
                Ok(status) => OutboxError::InvalidTransition { id, status },
                Err(e) => e,
            },
            Ok(None) => OutboxError::NotFound(id),
            Err(e) => OutboxError::Database(e),
        }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxStore {
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM outbox_events
            WHERE status IN ('PENDING', 'FAILED')
            ORDER BY created_at ASC, sequence ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn claim_batch(
        &self,
        relay_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // A pending older sibling outside our own row locks blocks the record,
        // whether it is leased or only row-locked by a concurrent claim.
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r#"
            WITH locked AS (
                SELECT o.id, o.aggregate_type, o.aggregate_id, o.created_at, o.sequence
                FROM outbox_events o
                WHERE o.status IN ('PENDING', 'FAILED')
                  AND (o.locked_until IS NULL OR o.locked_until < $3)
                ORDER BY o.created_at ASC, o.sequence ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ),
            claimable AS (
                SELECT l.id
                FROM locked l
                WHERE NOT EXISTS (
                    SELECT 1 FROM outbox_events older
                    WHERE older.aggregate_type = l.aggregate_type
                      AND older.aggregate_id = l.aggregate_id
                      AND older.status IN ('PENDING', 'FAILED')
                      AND (older.created_at, older.sequence) < (l.created_at, l.sequence)
                      AND older.id NOT IN (SELECT id FROM locked)
                )
            )
            UPDATE outbox_events e
            SET locked_by = $2, locked_until = $4
            FROM claimable
            WHERE e.id = claimable.id
            RETURNING {}
            "#,
            RECORD_COLUMNS
                .split(',')
                .map(|column| format!("e.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit as i64)
        .bind(relay_id)
        .bind(now)
        .bind(now + lease)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified
        records.sort_by_key(OutboxRecord::order_key);
        Ok(records)
    }

    async fn release(&self, id: Uuid) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_published(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PUBLISHED', published_at = $2,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id)
        .bind(when)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        when: DateTime<Utc>,
    ) -> Result<i32, OutboxError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', attempts = attempts + 1,
                last_attempt_at = $2, error_message = $3,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(when)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(attempts) => Ok(attempts),
            None => Err(self.transition_error(id).await),
        }
    }

    async fn mark_dead_lettered(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'DEAD_LETTERED', last_attempt_at = $2,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id)
        .bind(when)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRecord::try_from).transpose()
    }
}
