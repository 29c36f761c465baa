//! Redis Streams bus
//!
//! One stream per subject; durable consumers are consumer groups. Entries
//! that are read but not acknowledged stay in the group's pending list and
//! are read back (id `0`) after a nak or on the next binding.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Acknowledger, BusError, Delivery, MessageBus, Subscription};

const DATA_FIELD: &str = "data";

/// Bus backed by Redis Streams consumer groups
#[derive(Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    /// Shared by publishes; dropped after a failed command
    publisher: Arc<Mutex<Option<MultiplexedConnection>>>,
    consumer_name: String,
    block: Duration,
    redelivery_delay: Duration,
}

impl RedisStreamsBus {
    pub fn new(client: redis::Client, consumer_name: impl Into<String>) -> Self {
        Self {
            client,
            publisher: Arc::new(Mutex::new(None)),
            consumer_name: consumer_name.into(),
            block: Duration::from_secs(1),
            redelivery_delay: Duration::from_secs(1),
        }
    }

    /// Delay before naked entries are read back
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BusError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut publisher = self.publisher.lock().await;
        if let Some(connection) = publisher.as_ref() {
            return Ok(connection.clone());
        }
        let connection = self.client.get_multiplexed_async_connection().await?;
        *publisher = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut connection = self
            .publisher()
            .await
            .map_err(|e| BusError::publish(subject, e))?;

        let added: Result<String, redis::RedisError> =
            connection.xadd(subject, "*", &[(DATA_FIELD, payload)]).await;
        if let Err(e) = added {
            // Reconnect on the next publish
            self.publisher.lock().await.take();
            return Err(BusError::publish(subject, e));
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        // Blocking reads get a connection of their own
        let mut connection = self.connection().await?;

        let created: Result<(), redis::RedisError> = connection
            .xgroup_create_mkstream(subject, durable, "0")
            .await;
        match created {
            Ok(()) => {
                tracing::info!(subject, durable, "Created consumer group");
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                return Err(BusError::Subscribe {
                    subject: subject.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        Ok(Box::new(RedisSubscription {
            connection,
            subject: subject.to_string(),
            group: durable.to_string(),
            consumer: self.consumer_name.clone(),
            block: self.block,
            redelivery_delay: self.redelivery_delay,
            buffer: VecDeque::new(),
            seen: Arc::new(Mutex::new(DeliveryCounts::default())),
            // Entries left pending by a previous binding come first
            replay: Arc::new(Mutex::new(Some(Instant::now()))),
        }))
    }
}

/// Local delivery counts of entries not yet acknowledged
#[derive(Debug, Default)]
struct DeliveryCounts {
    counts: HashMap<String, u32>,
}

impl DeliveryCounts {
    /// Count one more delivery of `entry_id` and return the total
    fn record(&mut self, entry_id: &str) -> u32 {
        let count = self.counts.entry(entry_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&mut self, entry_id: &str) {
        self.counts.remove(entry_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.counts.len()
    }
}

struct RedisSubscription {
    connection: MultiplexedConnection,
    subject: String,
    group: String,
    consumer: String,
    block: Duration,
    redelivery_delay: Duration,
    buffer: VecDeque<StreamId>,
    seen: Arc<Mutex<DeliveryCounts>>,
    /// When set, read the pending list once this instant has passed
    replay: Arc<Mutex<Option<Instant>>>,
}

impl RedisSubscription {
    async fn read(&mut self, id: &str, block: Option<Duration>) -> Result<(), BusError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(32);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(&[self.subject.as_str()], &[id], &options)
            .await?;

        if let Some(reply) = reply {
            for key in reply.keys {
                self.buffer.extend(key.ids);
            }
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), BusError> {
        let due = {
            let mut replay = self.replay.lock().await;
            let scheduled = *replay;
            match scheduled {
                Some(at) if at <= Instant::now() => {
                    *replay = None;
                    true
                }
                _ => false,
            }
        };

        if due {
            self.read("0", None).await?;
            if !self.buffer.is_empty() {
                return Ok(());
            }
        }

        let block = match *self.replay.lock().await {
            Some(at) => self.block.min(at.saturating_duration_since(Instant::now())),
            None => self.block,
        };
        self.read(">", Some(block.max(Duration::from_millis(1)))).await
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                let Some(data) = entry.get::<Vec<u8>>(DATA_FIELD) else {
                    tracing::warn!(
                        subject = %self.subject,
                        entry_id = %entry.id,
                        "Stream entry without data field, acknowledging"
                    );
                    let _: i64 = self
                        .connection
                        .xack(&self.subject, &self.group, &[&entry.id])
                        .await?;
                    continue;
                };

                let count = self.seen.lock().await.record(&entry.id);

                let acker = RedisAcker {
                    connection: self.connection.clone(),
                    subject: self.subject.clone(),
                    group: self.group.clone(),
                    entry_id: entry.id,
                    seen: self.seen.clone(),
                    replay: self.replay.clone(),
                    redelivery_delay: self.redelivery_delay,
                };
                return Ok(Delivery::new(
                    self.subject.clone(),
                    data,
                    count,
                    Box::new(acker),
                ));
            }

            self.fill().await?;
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        // The group and its pending list persist for the next binding
        tracing::debug!(
            subject = %self.subject,
            group = %self.group,
            consumer = %self.consumer,
            "Unsubscribed from stream"
        );
        Ok(())
    }
}

struct RedisAcker {
    connection: MultiplexedConnection,
    subject: String,
    group: String,
    entry_id: String,
    seen: Arc<Mutex<DeliveryCounts>>,
    replay: Arc<Mutex<Option<Instant>>>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let _: i64 = connection
            .xack(&self.subject, &self.group, &[&self.entry_id])
            .await?;
        self.seen.lock().await.forget(&self.entry_id);
        Ok(())
    }

    async fn nak(self: Box<Self>) -> Result<(), BusError> {
        // Left in the pending list; schedule a read-back
        let mut replay = self.replay.lock().await;
        let at = Instant::now() + self.redelivery_delay;
        let scheduled = *replay;
        *replay = Some(scheduled.map_or(at, |existing| existing.min(at)));
        Ok(())
    }
}
