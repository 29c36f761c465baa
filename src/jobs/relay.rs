//! Outbox Relay
//!
//! Drains the transactional outbox onto the message bus.
//!
//! Each cycle leases a batch, publishes records in creation order and settles
//! each one independently. A failure defers the rest of that aggregate's
//! records until the next cycle so per-aggregate order holds. Records that
//! exhaust `max_attempts` go to the dead-letter stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::outbox::{OutboxError, OutboxRecord, OutboxRepository, OutboxSignal};

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Fallback polling period when no change notification arrives
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Failed attempts after which a record is dead-lettered
    pub max_attempts: i32,
    /// Lease length; a crashed relay's records are reclaimed after it
    pub claim_ttl: chrono::Duration,
    /// Subject prefix, messages go to `<topic_prefix>.<event_type>`
    pub topic_prefix: String,
    /// Dead letters go to `<dead_letter_prefix>.<event_type>`
    pub dead_letter_prefix: String,
    pub relay_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_attempts: 5,
            claim_ttl: chrono::Duration::seconds(30),
            topic_prefix: "treasury".to_string(),
            dead_letter_prefix: "treasury-dlq".to_string(),
            relay_id: format!("relay-{}", Uuid::new_v4()),
        }
    }
}

/// Outcome of one relay cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Released unpublished behind a failed sibling
    pub deferred: usize,
    /// Sent to the bus but not marked published
    pub unsettled: usize,
}

impl RelayReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// Relay errors that end a cycle early
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Claiming outbox batch failed: {0}")]
    Claim(#[source] OutboxError),
}

/// Background publisher for outbox records
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn MessageBus>,
    signal: OutboxSignal,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        bus: Arc<dyn MessageBus>,
        signal: OutboxSignal,
        config: RelayConfig,
    ) -> Self {
        Self {
            outbox,
            bus,
            signal,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start the relay in the background
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Poll on the interval or on change notifications until cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            relay_id = %self.config.relay_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox relay started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping outbox relay");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.signal.notified() => {}
            }

            self.drain(&shutdown).await;
        }

        tracing::info!(relay_id = %self.config.relay_id, "Outbox relay stopped");
    }

    /// Run cycles back to back while full batches keep making progress
    async fn drain(&self, shutdown: &CancellationToken) {
        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    if !report.is_idle() {
                        tracing::debug!(
                            claimed = report.claimed,
                            published = report.published,
                            failed = report.failed,
                            dead_lettered = report.dead_lettered,
                            deferred = report.deferred,
                            unsettled = report.unsettled,
                            "Outbox relay cycle completed"
                        );
                    }

                    let progressed = report.published + report.dead_lettered > 0;
                    if report.claimed < self.config.batch_size || !progressed {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Outbox relay cycle failed");
                    return;
                }
            }

            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Claim one batch and settle every record in it
    pub async fn run_cycle(&self) -> Result<RelayReport, RelayError> {
        let batch = self
            .outbox
            .claim_batch(
                &self.config.relay_id,
                self.config.batch_size,
                self.config.claim_ttl,
            )
            .await
            .map_err(RelayError::Claim)?;

        let mut report = RelayReport {
            claimed: batch.len(),
            ..RelayReport::default()
        };
        let mut stalled: HashSet<(String, Uuid)> = HashSet::new();

        for record in batch {
            let aggregate = (record.aggregate_type.clone(), record.aggregate_id);

            if stalled.contains(&aggregate) {
                if let Err(e) = self.outbox.release(record.id).await {
                    tracing::warn!(record_id = %record.id, error = %e, "Releasing deferred record failed");
                }
                report.deferred += 1;
                continue;
            }

            if record.attempts >= self.config.max_attempts {
                if self.dead_letter(&record).await {
                    report.dead_lettered += 1;
                } else {
                    stalled.insert(aggregate);
                }
                continue;
            }

            match self.publish(&record).await {
                Ok(()) => match self.outbox.mark_published(record.id, Utc::now()).await {
                    Ok(()) => report.published += 1,
                    Err(e) => {
                        // Sent but still deliverable; the lease expiry brings it back
                        tracing::error!(record_id = %record.id, error = %e, "Marking record published failed");
                        report.unsettled += 1;
                        stalled.insert(aggregate);
                    }
                },
                Err(message) => {
                    report.failed += 1;
                    stalled.insert(aggregate);

                    let attempts = match self.outbox.mark_failed(record.id, &message, Utc::now()).await {
                        Ok(attempts) => attempts,
                        Err(e) => {
                            tracing::error!(record_id = %record.id, error = %e, "Marking record failed failed");
                            continue;
                        }
                    };
                    tracing::warn!(
                        record_id = %record.id,
                        event_type = %record.event_type,
                        attempts,
                        error = %message,
                        "Outbox publish failed"
                    );

                    if attempts >= self.config.max_attempts {
                        let exhausted = OutboxRecord { attempts, ..record };
                        if self.dead_letter(&exhausted).await {
                            report.dead_lettered += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Publish to the domain subject; the error text is kept verbatim
    async fn publish(&self, record: &OutboxRecord) -> Result<(), String> {
        let subject = format!("{}.{}", self.config.topic_prefix, record.event_type);
        let bytes = record.to_message().to_bytes().map_err(|e| e.to_string())?;

        self.bus
            .publish(&subject, &bytes)
            .await
            .map_err(|e| e.to_string())
    }

    /// Park an exhausted record on the dead-letter stream; true once it is terminal
    async fn dead_letter(&self, record: &OutboxRecord) -> bool {
        let subject = format!("{}.{}", self.config.dead_letter_prefix, record.event_type);
        let published = match record.to_message().to_bytes() {
            Ok(bytes) => self.bus.publish(&subject, &bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(message) = published {
            tracing::error!(
                record_id = %record.id,
                subject = %subject,
                error = %message,
                "Dead-letter publish failed"
            );
            if let Err(e) = self.outbox.release(record.id).await {
                tracing::warn!(record_id = %record.id, error = %e, "Releasing record failed");
            }
            return false;
        }

        match self.outbox.mark_dead_lettered(record.id, Utc::now()).await {
            Ok(()) => {
                tracing::warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    attempts = record.attempts,
                    subject = %subject,
                    "Outbox record dead-lettered"
                );
                true
            }
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Marking record dead-lettered failed");
                false
            }
        }
    }
}
