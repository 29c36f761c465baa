//! Identity Event Consumer
//!
//! Mirrors users from the authentication service into the directory shadow.
//! Subscribes durably to the user lifecycle subjects; a message is
//! acknowledged only after the sync committed, anything else is naked and
//! stays redeliverable. A failing subscription is dropped and bound again
//! after a backoff; only cancellation ends the task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, Delivery, MessageBus, Subscription};
use crate::domain::events::{USER_CREATED_SUBJECT, USER_UPDATED_SUBJECT};
use crate::domain::{IdentityEvent, IdentityEventError};
use crate::error::AppError;
use crate::handlers::DirectorySyncService;

/// Durable consumer bound to `auth.user.created`
pub const USER_CREATED_DURABLE: &str = "treasury-user-created";
/// Durable consumer bound to `auth.user.updated`
pub const USER_UPDATED_DURABLE: &str = "treasury-user-updated";

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Why a delivery was not acknowledged
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Payload could not be parsed; naked, never dropped
    #[error("Poison message on '{subject}': {source}")]
    Poison {
        subject: String,
        #[source]
        source: IdentityEventError,
    },

    #[error("Directory sync failed: {0}")]
    Sync(#[source] AppError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Subscriber for one identity subject
pub struct IdentityConsumer {
    bus: Arc<dyn MessageBus>,
    directory: DirectorySyncService,
    subject: String,
    durable: String,
    retry_backoff: Duration,
}

impl IdentityConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        directory: DirectorySyncService,
        subject: &str,
        durable: &str,
    ) -> Self {
        Self {
            bus,
            directory,
            subject: subject.to_string(),
            durable: durable.to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Consumers for both user lifecycle subjects
    pub fn user_lifecycle(bus: Arc<dyn MessageBus>, directory: DirectorySyncService) -> Vec<Self> {
        vec![
            Self::new(bus.clone(), directory.clone(), USER_CREATED_SUBJECT, USER_CREATED_DURABLE),
            Self::new(bus, directory, USER_UPDATED_SUBJECT, USER_UPDATED_DURABLE),
        ]
    }

    /// First delay before binding again after a bus failure; doubles up to 30s
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Start the consumer in the background
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Consume until cancelled, binding the durable again after bus failures.
    ///
    /// A delivery already taken is settled before the subscription is closed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = self.retry_backoff;

        loop {
            match self.bus.subscribe(&self.subject, &self.durable).await {
                Ok(mut subscription) => {
                    tracing::info!(subject = %self.subject, durable = %self.durable, "Identity consumer subscribed");

                    let mut handled = 0usize;
                    let outcome = self.consume(&mut *subscription, &shutdown, &mut handled).await;

                    if let Err(e) = subscription.unsubscribe().await {
                        tracing::warn!(subject = %self.subject, error = %e, "Unsubscribe failed");
                    }

                    match outcome {
                        Ok(()) => break,
                        Err(e) => {
                            if handled > 0 {
                                backoff = self.retry_backoff;
                            }
                            tracing::error!(
                                subject = %self.subject,
                                error = %e,
                                retry_in_ms = backoff.as_millis() as u64,
                                "Receiving identity events failed, subscribing again"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        subject = %self.subject,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Subscribing to identity events failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }

        tracing::info!(subject = %self.subject, "Identity consumer stopped");
    }

    /// Returns `Ok` once cancelled, the bus error otherwise
    async fn consume(
        &self,
        subscription: &mut dyn Subscription,
        shutdown: &CancellationToken,
        handled: &mut usize,
    ) -> Result<(), BusError> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = subscription.next() => next?,
            };

            *handled += 1;
            if let Err(e) = self.handle(delivery).await {
                tracing::warn!(subject = %self.subject, error = %e, "Identity event not acknowledged");
            }
        }
    }

    /// Parse, sync and settle one delivery; `Ok` means it was acknowledged
    pub async fn handle(&self, delivery: Delivery) -> Result<(), ConsumeError> {
        let event = match IdentityEvent::parse(&delivery.data) {
            Ok(event) => event,
            Err(source) => {
                tracing::warn!(
                    subject = %delivery.subject,
                    delivery_count = delivery.delivery_count,
                    error = %source,
                    "Poison identity event"
                );
                delivery.nak().await?;
                return Err(ConsumeError::Poison {
                    subject: self.subject.clone(),
                    source,
                });
            }
        };

        let synced = match event.observed_at {
            Some(at) => {
                self.directory
                    .sync_user_at(event.tenant_id, event.external_id, &event.email, at)
                    .await
            }
            None => {
                self.directory
                    .sync_user(event.tenant_id, event.external_id, &event.email)
                    .await
            }
        };

        match synced {
            Ok(user) => {
                delivery.ack().await?;
                tracing::debug!(
                    tenant_id = %user.tenant_id,
                    external_id = %user.external_id,
                    subject = %self.subject,
                    "Identity event applied"
                );
                Ok(())
            }
            Err(e) => {
                delivery.nak().await?;
                Err(ConsumeError::Sync(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use crate::bus::InMemoryBus;
    use crate::domain::DirectoryUser;
    use crate::repository::{DirectoryRepository, InMemoryStore, StoreError};

    fn consumer(bus: &InMemoryBus, store: &Arc<InMemoryStore>) -> IdentityConsumer {
        IdentityConsumer::new(
            Arc::new(bus.clone()),
            DirectorySyncService::new(store.clone()),
            USER_CREATED_SUBJECT,
            USER_CREATED_DURABLE,
        )
    }

    async fn next_delivery(bus: &InMemoryBus) -> (Box<dyn Subscription>, Delivery) {
        let mut sub = bus
            .subscribe(USER_CREATED_SUBJECT, USER_CREATED_DURABLE)
            .await
            .unwrap();
        let delivery = sub.next().await.unwrap();
        (sub, delivery)
    }

    #[tokio::test]
    async fn test_valid_event_is_synced_and_acked() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let (tenant, user) = (Uuid::new_v4(), Uuid::new_v4());
        let payload = json!({
            "user_id": user.to_string(),
            "tenant_id": tenant.to_string(),
            "email": "ana@acme.io",
        });
        bus.publish(USER_CREATED_SUBJECT, payload.to_string().as_bytes()).await.unwrap();

        let (_sub, delivery) = next_delivery(&bus).await;
        consumer(&bus, &store).handle(delivery).await.unwrap();

        assert_eq!(bus.acked_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 1);
        let synced = DirectorySyncService::new(store.clone())
            .find_by_external_id(tenant, user)
            .await
            .unwrap();
        assert_eq!(synced.email, "ana@acme.io");
    }

    #[tokio::test]
    async fn test_bad_uuid_is_naked_and_redeliverable() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let payload = json!({"user_id": "not-a-uuid", "tenant_id": Uuid::new_v4().to_string(), "email": "x@acme.io"});
        bus.publish(USER_CREATED_SUBJECT, payload.to_string().as_bytes()).await.unwrap();

        let (mut sub, delivery) = next_delivery(&bus).await;
        let result = consumer(&bus, &store).handle(delivery).await;
        assert!(matches!(result, Err(ConsumeError::Poison { .. })));

        assert_eq!(bus.unacked_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 1);
        let again = sub.next().await.unwrap();
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_sync_failure_naks() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let payload = json!({
            "user_id": Uuid::new_v4().to_string(),
            "tenant_id": Uuid::new_v4().to_string(),
            "email": "down@acme.io",
        });
        bus.publish(USER_CREATED_SUBJECT, payload.to_string().as_bytes()).await.unwrap();
        store.set_unavailable(true);

        let (_sub, delivery) = next_delivery(&bus).await;
        let result = consumer(&bus, &store).handle(delivery).await;

        assert!(matches!(result, Err(ConsumeError::Sync(_))));
        assert_eq!(bus.acked_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 0);
    }

    async fn wait_for_subscribers(bus: &InMemoryBus, expected: usize) {
        for _ in 0..100 {
            if bus.subscriber_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} subscribers", expected);
    }

    async fn wait_for_acks(bus: &InMemoryBus, expected: usize) {
        for _ in 0..100 {
            if bus.acked_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} acknowledged messages", expected);
    }

    fn created_event(tenant: Uuid, user: Uuid, email: &str) -> Vec<u8> {
        json!({
            "user_id": user.to_string(),
            "tenant_id": tenant.to_string(),
            "email": email,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_cancellation_unsubscribes() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let shutdown = CancellationToken::new();
        let handle = consumer(&bus, &store).start(shutdown.clone());

        wait_for_subscribers(&bus, 1).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should stop")
            .unwrap();
        assert_eq!(bus.subscriber_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 0);
    }

    // =========================================================================
    // Recovery from bus failures
    // =========================================================================

    /// Bus whose subscriptions fail `next()` while `failures` is non-zero
    struct FlakyBus {
        inner: InMemoryBus,
        failures: Arc<AtomicUsize>,
    }

    struct FlakySubscription {
        inner: Box<dyn Subscription>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
            self.inner.publish(subject, payload).await
        }

        async fn subscribe(
            &self,
            subject: &str,
            durable: &str,
        ) -> Result<Box<dyn Subscription>, BusError> {
            let inner = self.inner.subscribe(subject, durable).await?;
            Ok(Box::new(FlakySubscription {
                inner,
                failures: self.failures.clone(),
            }))
        }
    }

    #[async_trait]
    impl Subscription for FlakySubscription {
        async fn next(&mut self) -> Result<Delivery, BusError> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(BusError::Subscribe {
                    subject: USER_CREATED_SUBJECT.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.next().await
        }

        async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
            self.inner.unsubscribe().await
        }
    }

    #[tokio::test]
    async fn test_receive_error_resubscribes_and_keeps_consuming() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let flaky = FlakyBus {
            inner: bus.clone(),
            failures: Arc::new(AtomicUsize::new(1)),
        };
        let (tenant, user) = (Uuid::new_v4(), Uuid::new_v4());
        bus.publish(USER_CREATED_SUBJECT, &created_event(tenant, user, "ana@acme.io"))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = IdentityConsumer::new(
            Arc::new(flaky),
            DirectorySyncService::new(store.clone()),
            USER_CREATED_SUBJECT,
            USER_CREATED_DURABLE,
        )
        .with_retry_backoff(Duration::from_millis(10))
        .start(shutdown.clone());

        wait_for_acks(&bus, 1).await;
        assert!(!handle.is_finished());
        // The failed binding was released before binding again
        assert_eq!(bus.subscriber_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 1);

        let synced = DirectorySyncService::new(store.clone())
            .find_by_external_id(tenant, user)
            .await
            .unwrap();
        assert_eq!(synced.email, "ana@acme.io");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should stop")
            .unwrap();
    }

    // =========================================================================
    // Shutdown while handling
    // =========================================================================

    /// Directory whose upserts wait for `release`
    struct GatedDirectory {
        inner: Arc<InMemoryStore>,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl DirectoryRepository for GatedDirectory {
        async fn find_by_external_id(
            &self,
            tenant_id: Uuid,
            external_id: Uuid,
        ) -> Result<Option<DirectoryUser>, StoreError> {
            self.inner.find_by_external_id(tenant_id, external_id).await
        }

        async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<DirectoryUser>, StoreError> {
            self.inner.get_user(tenant_id, id).await
        }

        async fn upsert_synced(
            &self,
            tenant_id: Uuid,
            external_id: Uuid,
            email: &str,
            observed_at: DateTime<Utc>,
        ) -> Result<DirectoryUser, StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner
                .upsert_synced(tenant_id, external_id, email, observed_at)
                .await
        }

        async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<DirectoryUser>, StoreError> {
            self.inner.list_users(tenant_id).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_settles_in_flight_delivery() {
        let bus = InMemoryBus::new();
        let store = Arc::new(InMemoryStore::new());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let directory = DirectorySyncService::new(Arc::new(GatedDirectory {
            inner: store.clone(),
            entered: entered.clone(),
            release: release.clone(),
        }));

        let shutdown = CancellationToken::new();
        let handle = IdentityConsumer::new(
            Arc::new(bus.clone()),
            directory,
            USER_CREATED_SUBJECT,
            USER_CREATED_DURABLE,
        )
        .start(shutdown.clone());

        let (tenant, user) = (Uuid::new_v4(), Uuid::new_v4());
        bus.publish(USER_CREATED_SUBJECT, &created_event(tenant, user, "busy@acme.io"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), entered.notified())
            .await
            .expect("sync should start");

        // Cancelled mid-sync: the consumer waits for the handler
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(bus.subscriber_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 1);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should stop")
            .unwrap();

        assert_eq!(bus.acked_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 1);
        assert_eq!(bus.subscriber_count(USER_CREATED_SUBJECT, USER_CREATED_DURABLE).await, 0);
        assert!(store.find_by_external_id(tenant, user).await.unwrap().is_some());
    }
}
