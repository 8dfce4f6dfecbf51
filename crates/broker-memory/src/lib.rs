//! In-memory broker for tests and single process deployments.
//!
//! Queues are shared between clones of a [`MemoryBroker`] but not between
//! separately constructed brokers. Consumers on the same queue compete for
//! messages, prefetch windows bound the number of unsettled deliveries, and
//! rejected or dropped deliveries go back on the queue.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod queue;

pub use error::Error;

use queue::{ConsumerGuard, MemoryAcker, MemoryQueue, Queued};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use mqrpc_broker::{
    Broker, ConsumeOptions, Delivery, DeliveryStream, Message, QueueOptions,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use uuid::Uuid;

/// Prefix for broker generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// An in-memory broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    closed: Arc<AtomicBool>,
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ready messages in a queue, if it exists.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.len())
    }

    /// Number of live consumers on a queue, if it exists.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.queues
            .get(queue)
            .map(|q| q.consumers.load(Ordering::SeqCst))
    }

    /// Whether a queue currently exists.
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

struct ConsumerState {
    auto_ack: bool,
    guard: ConsumerGuard,
    next_tag: u64,
    window: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;

    async fn declare_queue(&self, options: QueueOptions) -> Result<String, Self::Error> {
        self.ensure_open()?;

        let name = if options.name.is_empty() {
            format!("{GENERATED_QUEUE_PREFIX}{}", Uuid::new_v4().simple())
        } else {
            options.name.clone()
        };

        let entry = self
            .queues
            .entry(name.clone())
            .or_insert_with(|| {
                debug!("declaring queue {}", name);
                Arc::new(MemoryQueue::new(name.clone(), options.clone()))
            });

        let existing = &entry.value().options;
        if existing.durable != options.durable
            || existing.exclusive != options.exclusive
            || existing.auto_delete != options.auto_delete
        {
            return Err(Error::PreconditionFailed(name));
        }

        Ok(name)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Self::Error> {
        self.ensure_open()?;

        let queue = self
            .queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let exclusive = options.exclusive || queue.options.exclusive;
        let previous = queue.consumers.fetch_add(1, Ordering::SeqCst);
        let guard = ConsumerGuard {
            queue: Arc::clone(&queue),
            queues: Arc::downgrade(&self.queues),
        };
        if exclusive && previous > 0 {
            return Err(Error::ExclusiveInUse(queue.name.clone()));
        }

        debug!(
            "consuming from {} (prefetch: {:?}, auto_ack: {})",
            queue.name, options.prefetch, options.auto_ack
        );

        let state = ConsumerState {
            auto_ack: options.auto_ack,
            guard,
            next_tag: 0,
            window: options
                .prefetch
                .filter(|p| *p > 0)
                .map(|p| Arc::new(Semaphore::new(usize::from(p)))),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            let queue = Arc::clone(&state.guard.queue);

            loop {
                let permit = match &state.window {
                    Some(window) => tokio::select! {
                        biased;
                        () = queue.closed.cancelled() => return None,
                        permit = Arc::clone(window).acquire_owned() => Some(permit.ok()?),
                    },
                    None => None,
                };

                let queued: Queued = tokio::select! {
                    biased;
                    () = queue.closed.cancelled() => return None,
                    queued = queue.rx.recv_async() => queued.ok()?,
                };

                if queued.is_expired() {
                    trace!("dropping expired message from {}", queue.name);
                    continue;
                }

                state.next_tag += 1;
                let message = queued.message.clone();
                let redelivered = queued.redelivered;
                let pending = if state.auto_ack {
                    None
                } else {
                    Some((queued, permit))
                };
                let acker = MemoryAcker {
                    auto_ack: state.auto_ack,
                    delivery_tag: state.next_tag,
                    pending: Mutex::new(pending),
                    queue: Arc::clone(&queue),
                };

                let delivery =
                    Delivery::new(message, state.next_tag, redelivered, Box::new(acker));
                return Some((delivery, state));
            }
        });

        Ok(Box::pin(stream))
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), Self::Error> {
        self.ensure_open()?;

        match self.queues.get(queue) {
            Some(q) => {
                trace!("publishing {} bytes to {}", message.body.len(), queue);
                q.enqueue(Queued::new(message));
            }
            None => debug!("no queue {} to route to, dropping message", queue),
        }

        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), Self::Error> {
        self.ensure_open()?;

        if let Some((_, q)) = self.queues.remove(queue) {
            q.closed.cancel();
            debug!("deleted queue {}", queue);
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::SeqCst);

        for entry in self.queues.iter() {
            entry.value().closed.cancel();
        }
        self.queues.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use futures::StreamExt;
    use mqrpc_broker::MessageProperties;
    use tokio::time::timeout;

    async fn broker_with_queue(name: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QueueOptions::named(name))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        broker
            .publish("work", Message::new(Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.message().body, Bytes::from_static(b"hello"));
        assert_eq!(delivery.delivery_tag(), 1);
        assert!(!delivery.redelivered());
        delivery.ack().await.unwrap();
        assert_eq!(broker.message_count("work"), Some(0));
    }

    #[tokio::test]
    async fn test_server_named_queue() {
        let broker = MemoryBroker::new();
        let name = broker
            .declare_queue(QueueOptions::server_named())
            .await
            .unwrap();

        assert!(name.starts_with(GENERATED_QUEUE_PREFIX));
        assert!(broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_options_fails() {
        let broker = broker_with_queue("work").await;
        let result = broker
            .declare_queue(QueueOptions::named("work").with_durable(true))
            .await;

        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_prefetch_window_blocks_until_ack() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default().with_prefetch(1))
            .await
            .unwrap();

        broker.publish("work", Message::new("one")).await.unwrap();
        broker.publish("work", Message::new("two")).await.unwrap();

        let first = deliveries.next().await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), deliveries.next())
                .await
                .is_err()
        );

        first.ack().await.unwrap();
        let second = timeout(Duration::from_secs(1), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message().body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_competing_consumers_split_messages() {
        let broker = broker_with_queue("work").await;
        let options = ConsumeOptions::default().with_prefetch(1);
        let mut a = broker.consume("work", options.clone()).await.unwrap();
        let mut b = broker.consume("work", options).await.unwrap();

        broker.publish("work", Message::new("one")).await.unwrap();
        broker.publish("work", Message::new("two")).await.unwrap();

        let from_a = a.next().await.unwrap();
        let from_b = b.next().await.unwrap();
        assert_ne!(from_a.message().body, from_b.message().body);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        broker.publish("work", Message::new("retry")).await.unwrap();
        deliveries.next().await.unwrap().nack(true).await.unwrap();

        let again = deliveries.next().await.unwrap();
        assert!(again.redelivered());
        assert_eq!(again.message().body, Bytes::from_static(b"retry"));
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        broker.publish("work", Message::new("gone")).await.unwrap();
        deliveries.next().await.unwrap().nack(false).await.unwrap();

        assert!(
            timeout(Duration::from_millis(50), deliveries.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        broker.publish("work", Message::new("lost")).await.unwrap();
        drop(deliveries.next().await.unwrap());

        assert!(deliveries.next().await.unwrap().redelivered());
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped() {
        let broker = broker_with_queue("work").await;
        let properties = MessageProperties::default().with_expiration(Duration::from_millis(10));
        broker
            .publish("work", Message::new("stale").with_properties(properties))
            .await
            .unwrap();
        broker.publish("work", Message::new("fresh")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.message().body, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_exclusive_queue_refuses_second_consumer() {
        let broker = MemoryBroker::new();
        let name = broker
            .declare_queue(QueueOptions::server_named())
            .await
            .unwrap();

        let _first = broker
            .consume(&name, ConsumeOptions::default())
            .await
            .unwrap();
        let second = broker.consume(&name, ConsumeOptions::default()).await;

        assert!(matches!(second, Err(Error::ExclusiveInUse(_))));
    }

    #[tokio::test]
    async fn test_auto_delete_queue_removed_with_consumer() {
        let broker = MemoryBroker::new();
        let name = broker
            .declare_queue(QueueOptions::server_named())
            .await
            .unwrap();

        let deliveries = broker
            .consume(&name, ConsumeOptions::default().with_auto_ack(true))
            .await
            .unwrap();
        assert!(broker.queue_exists(&name));

        drop(deliveries);
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("nowhere", Message::new("x")).await.unwrap();
        assert!(!broker.queue_exists("nowhere"));
    }

    #[tokio::test]
    async fn test_consume_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let result = broker.consume("nowhere", ConsumeOptions::default()).await;
        assert!(matches!(result, Err(Error::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_queue_ends_stream() {
        let broker = broker_with_queue("work").await;
        let mut deliveries = broker
            .consume("work", ConsumeOptions::default())
            .await
            .unwrap();

        broker.delete_queue("work").await.unwrap();
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = broker_with_queue("work").await;
        broker.close().await.unwrap();

        let result = broker.publish("work", Message::new("x")).await;
        assert!(matches!(result, Err(Error::Closed)));
    }
}
