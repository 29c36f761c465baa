//! Message bus module
//!
//! Subject-addressed publish and durable, at-least-once subscriptions.
//! Deliveries stay redeliverable until acknowledged.

mod memory;
mod redis_streams;

pub use memory::InMemoryBus;
pub use redis_streams::RedisStreamsBus;

use async_trait::async_trait;

/// Errors raised by bus adapters
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Publish to '{subject}' failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("Subscribe to '{subject}' failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BusError {
    pub fn publish(subject: &str, reason: impl ToString) -> Self {
        BusError::Publish {
            subject: subject.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Publisher and durable-subscription factory
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and wait for the broker to accept the message
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Bind to the durable consumer `durable` on `subject`.
    ///
    /// Binding the same durable again resumes where it left off.
    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

/// Pull side of a durable consumer
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery
    async fn next(&mut self) -> Result<Delivery, BusError>;

    /// Detach; unacknowledged deliveries become redeliverable
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

/// Settles one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;

    async fn nak(self: Box<Self>) -> Result<(), BusError>;
}

/// One message handed to a subscriber
pub struct Delivery {
    pub subject: String,
    pub data: Vec<u8>,
    /// 1 on first delivery
    pub delivery_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        data: Vec<u8>,
        delivery_count: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            data,
            delivery_count,
            acker,
        }
    }

    /// Confirm processing; the message will not be delivered again
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Reject; the message stays redeliverable
    pub async fn nak(self) -> Result<(), BusError> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("bytes", &self.data.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
