//! In-memory bus
//!
//! Per-subject append-only streams with named consumer groups. A group keeps
//! its read cursor, in-flight deliveries and a redelivery queue, so nak and
//! unsubscribe behave like a durable broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Acknowledger, BusError, Delivery, MessageBus, Subscription};

#[derive(Debug, Default)]
struct Group {
    next_index: usize,
    /// Message index -> subscription holding it
    in_flight: HashMap<usize, u64>,
    redeliver: VecDeque<usize>,
    acked: HashSet<usize>,
    delivery_counts: HashMap<usize, u32>,
    subscribers: usize,
}

#[derive(Debug, Default)]
struct Stream {
    messages: Vec<Vec<u8>>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct BusState {
    streams: HashMap<String, Stream>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BusState>,
    notify: Notify,
    failing_publishes: AtomicUsize,
    next_subscription_id: AtomicU64,
}

/// Bus kept entirely in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` publishes
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Every payload ever published on `subject`, in order
    pub async fn messages(&self, subject: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(subject)
            .map(|stream| stream.messages.clone())
            .unwrap_or_default()
    }

    /// Messages of `subject` acknowledged by the durable `durable`
    pub async fn acked_count(&self, subject: &str, durable: &str) -> usize {
        self.with_group(subject, durable, |group| group.acked.len())
            .await
    }

    /// Messages of `subject` the durable `durable` has not acknowledged yet
    pub async fn unacked_count(&self, subject: &str, durable: &str) -> usize {
        let state = self.shared.state.lock().await;
        let Some(stream) = state.streams.get(subject) else {
            return 0;
        };
        let acked = stream
            .groups
            .get(durable)
            .map_or(0, |group| group.acked.len());
        stream.messages.len() - acked
    }

    /// Currently bound subscriptions of a durable
    pub async fn subscriber_count(&self, subject: &str, durable: &str) -> usize {
        self.with_group(subject, durable, |group| group.subscribers)
            .await
    }

    async fn with_group<T: Default>(
        &self,
        subject: &str,
        durable: &str,
        f: impl FnOnce(&Group) -> T,
    ) -> T {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(subject)
            .and_then(|stream| stream.groups.get(durable))
            .map(f)
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.shared
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.take_injected_failure() {
            return Err(BusError::publish(subject, "broker unavailable"));
        }

        let mut state = self.shared.state.lock().await;
        state
            .streams
            .entry(subject.to_string())
            .or_default()
            .messages
            .push(payload.to_vec());
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.shared.state.lock().await;
        let group = state
            .streams
            .entry(subject.to_string())
            .or_default()
            .groups
            .entry(durable.to_string())
            .or_default();
        group.subscribers += 1;

        Ok(Box::new(InMemorySubscription {
            shared: self.shared.clone(),
            id: self.shared.next_subscription_id.fetch_add(1, Ordering::SeqCst),
            subject: subject.to_string(),
            durable: durable.to_string(),
        }))
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    id: u64,
    subject: String,
    durable: String,
}

impl InMemorySubscription {
    /// Hand out the next redelivery or unread message, if any
    async fn try_take(&self) -> Option<(usize, Vec<u8>, u32)> {
        let mut state = self.shared.state.lock().await;
        let stream = state.streams.get_mut(&self.subject)?;
        let group = stream.groups.get_mut(&self.durable)?;

        let index = match group.redeliver.pop_front() {
            Some(index) => index,
            None if group.next_index < stream.messages.len() => {
                group.next_index += 1;
                group.next_index - 1
            }
            None => return None,
        };

        group.in_flight.insert(index, self.id);
        let count = group.delivery_counts.entry(index).or_insert(0);
        *count += 1;
        Some((index, stream.messages[index].clone(), *count))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Delivery, BusError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed
            notified.as_mut().enable();

            if let Some((index, data, delivery_count)) = self.try_take().await {
                let acker = InMemoryAcker {
                    shared: self.shared.clone(),
                    subject: self.subject.clone(),
                    durable: self.durable.clone(),
                    index,
                };
                return Ok(Delivery::new(
                    self.subject.clone(),
                    data,
                    delivery_count,
                    Box::new(acker),
                ));
            }

            notified.await;
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.shared.state.lock().await;
        if let Some(group) = state
            .streams
            .get_mut(&self.subject)
            .and_then(|stream| stream.groups.get_mut(&self.durable))
        {
            let held: Vec<usize> = group
                .in_flight
                .iter()
                .filter(|(_, holder)| **holder == self.id)
                .map(|(index, _)| *index)
                .collect();
            for index in held {
                group.in_flight.remove(&index);
                group.redeliver.push_back(index);
            }
            group.subscribers = group.subscribers.saturating_sub(1);
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    subject: String,
    durable: String,
    index: usize,
}

impl InMemoryAcker {
    async fn settle(&self, requeue: bool) -> Result<(), BusError> {
        let mut state = self.shared.state.lock().await;
        let group = state
            .streams
            .get_mut(&self.subject)
            .and_then(|stream| stream.groups.get_mut(&self.durable))
            .ok_or_else(|| BusError::Ack(format!("unknown durable '{}'", self.durable)))?;

        if group.in_flight.remove(&self.index).is_none() {
            return Err(BusError::Ack(format!(
                "message {} on '{}' is not in flight",
                self.index, self.subject
            )));
        }

        if requeue {
            group.redeliver.push_back(self.index);
        } else {
            group.acked.insert(self.index);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.settle(false).await
    }

    async fn nak(self: Box<Self>) -> Result<(), BusError> {
        self.settle(true).await?;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_nak_redelivers_with_count() {
        let bus = InMemoryBus::new();
        bus.publish("auth.user.created", b"one").await.unwrap();

        let mut sub = bus.subscribe("auth.user.created", "worker").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.delivery_count, 1);
        first.nak().await.unwrap();

        let again = sub.next().await.unwrap();
        assert_eq!(again.data, b"one");
        assert_eq!(again.delivery_count, 2);
        again.ack().await.unwrap();

        assert_eq!(bus.acked_count("auth.user.created", "worker").await, 1);
        assert_eq!(bus.unacked_count("auth.user.created", "worker").await, 0);
    }

    #[tokio::test]
    async fn test_next_waits_for_publish() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("treasury.role.assigned", "audit").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("treasury.role.assigned", b"late").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery should arrive")
            .unwrap();
        assert_eq!(delivery.data, b"late");
    }

    #[tokio::test]
    async fn test_durable_resumes_after_unsubscribe() {
        let bus = InMemoryBus::new();
        bus.publish("s", b"a").await.unwrap();
        bus.publish("s", b"b").await.unwrap();

        let mut sub = bus.subscribe("s", "d").await.unwrap();
        sub.next().await.unwrap().ack().await.unwrap();
        let _held = sub.next().await.unwrap();
        sub.unsubscribe().await.unwrap();
        assert_eq!(bus.subscriber_count("s", "d").await, 0);

        // The unsettled message comes back to the next binding
        let mut resumed = bus.subscribe("s", "d").await.unwrap();
        let delivery = resumed.next().await.unwrap();
        assert_eq!(delivery.data, b"b");
        assert_eq!(delivery.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish("s", b"x").await.is_err());
        assert!(bus.publish("s", b"y").await.is_ok());
        assert_eq!(bus.messages("s").await, vec![b"y".to_vec()]);
    }
}
