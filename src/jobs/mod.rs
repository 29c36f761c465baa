//! Background Jobs
//!
//! Long-running tasks of the worker process: the outbox relay and the
//! identity event consumers. They share nothing in process except the store
//! and stop together on one cancellation token.

pub mod identity_consumer;
pub mod relay;

pub use identity_consumer::{ConsumeError, IdentityConsumer};
pub use relay::{OutboxRelay, RelayConfig, RelayError, RelayReport};

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Worker - runs the relay and the consumers until shutdown
pub struct Worker {
    relay: OutboxRelay,
    consumers: Vec<IdentityConsumer>,
    shutdown: CancellationToken,
}

/// Handles of a started [`Worker`]
pub struct RunningWorker {
    shutdown: CancellationToken,
    relay: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(relay: OutboxRelay, consumers: Vec<IdentityConsumer>) -> Self {
        Self {
            relay,
            consumers,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn every task
    pub fn start(self) -> RunningWorker {
        tracing::info!(consumers = self.consumers.len(), "Worker started");

        let relay = self.relay.start(self.shutdown.child_token());
        let consumers = self
            .consumers
            .into_iter()
            .map(|consumer| consumer.start(self.shutdown.child_token()))
            .collect();

        RunningWorker {
            shutdown: self.shutdown,
            relay,
            consumers,
        }
    }
}

impl RunningWorker {
    /// Cancel every task and wait up to `grace` for them to drain
    pub async fn stop(self, grace: Duration) {
        self.shutdown.cancel();

        let drained = tokio::time::timeout(grace, async {
            for handle in self.consumers {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Identity consumer task panicked");
                }
            }
            if let Err(e) = self.relay.await {
                tracing::error!(error = %e, "Outbox relay task panicked");
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::info!("Worker stopped"),
            Err(_) => tracing::warn!(grace_ms = grace.as_millis() as u64, "Worker did not drain in time"),
        }
    }
}
