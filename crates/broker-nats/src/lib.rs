//! NATS backed broker.
//!
//! Queues map onto subjects. Consumers of a named queue join a queue group
//! of the same name, so each message reaches exactly one of them. Server
//! named queues are NATS inboxes. Message properties travel as headers.
//!
//! Core NATS has no acknowledgements: the prefetch window is enforced
//! locally, acks only release the window, and a requeueing nack republishes
//! the message. A delivery dropped without being settled is lost.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod headers;

pub use error::Error;

use std::sync::Arc;

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mqrpc_broker::{
    AckError, Acker, Broker, ConsumeOptions, Delivery, DeliveryStream, Message, QueueOptions,
};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

/// A broker on top of a NATS connection.
#[derive(Clone, Debug)]
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    /// Connects to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;

        debug!("connected to nats at {}", url);

        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;

    async fn declare_queue(&self, options: QueueOptions) -> Result<String, Self::Error> {
        if options.name.is_empty() {
            return Ok(self.client.new_inbox());
        }

        if options.durable {
            debug!("queue {} is not persisted on core nats", options.name);
        }

        Ok(options.name)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Self::Error> {
        let subscriber = if options.exclusive {
            self.client.subscribe(queue.to_string()).await
        } else {
            self.client
                .queue_subscribe(queue.to_string(), queue.to_string())
                .await
        }
        .map_err(|e| Error::Subscribe(e.to_string()))?;

        let window = options
            .prefetch
            .filter(|_| !options.auto_ack)
            .map(|prefetch| Arc::new(Semaphore::new(usize::from(prefetch.max(1)))));

        debug!(
            "consuming from {} (prefetch: {:?}, auto_ack: {})",
            queue, options.prefetch, options.auto_ack
        );

        let consumer = Consumer {
            auto_ack: options.auto_ack,
            client: self.client.clone(),
            delivery_tag: 0,
            queue: queue.to_string(),
            subscriber,
            window,
        };

        Ok(Box::pin(futures::stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((delivery, consumer))
        })))
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), Self::Error> {
        let headers = headers::encode(&message.properties);

        self.client
            .publish_with_headers(queue.to_string(), headers, message.body)
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), Self::Error> {
        // Subjects vanish with their last subscriber.
        trace!("delete of {} is a no-op on core nats", queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }
}

struct Consumer {
    auto_ack: bool,
    client: Client,
    delivery_tag: u64,
    queue: String,
    subscriber: async_nats::Subscriber,
    window: Option<Arc<Semaphore>>,
}

impl Consumer {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = match &self.window {
            Some(window) => Some(Arc::clone(window).acquire_owned().await.ok()?),
            None => None,
        };

        loop {
            let message = self.subscriber.next().await?;
            let headers = message.headers.as_ref();

            if headers::time_to_live(headers).is_some_and(|ttl| ttl.is_zero()) {
                trace!("dropping expired message from {}", self.queue);
                continue;
            }

            self.delivery_tag += 1;

            let redelivered = headers::is_redelivered(headers);
            let properties = headers::decode(headers);
            let body = message.payload.clone();

            let acker = NatsAcker {
                client: self.client.clone(),
                delivery_tag: self.delivery_tag,
                headers: message.headers.unwrap_or_default(),
                payload: message.payload,
                queue: self.queue.clone(),
                auto_ack: self.auto_ack,
                unsettled: Mutex::new(Some(permit)),
            };

            return Some(Delivery::new(
                Message::new(body).with_properties(properties),
                self.delivery_tag,
                redelivered,
                Box::new(acker),
            ));
        }
    }
}

/// Settles a NATS delivery by releasing its prefetch slot, republishing it
/// on a requeueing nack.
#[derive(Debug)]
struct NatsAcker {
    auto_ack: bool,
    client: Client,
    delivery_tag: u64,
    headers: HeaderMap,
    payload: Bytes,
    queue: String,
    unsettled: Mutex<Option<Option<OwnedSemaphorePermit>>>,
}

impl NatsAcker {
    fn settle(&self) -> Result<(), AckError> {
        self.unsettled
            .lock()
            .take()
            .map(drop)
            .ok_or(AckError::AlreadySettled(self.delivery_tag))
    }
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), AckError> {
        if self.auto_ack {
            return Ok(());
        }

        self.settle()
    }

    async fn nack(&self, requeue: bool) -> Result<(), AckError> {
        if self.auto_ack {
            return Ok(());
        }

        self.settle()?;

        if requeue {
            let mut headers = self.headers.clone();
            headers.insert(headers::REDELIVERED, "true");

            self.client
                .publish_with_headers(self.queue.clone(), headers, self.payload.clone())
                .await
                .map_err(|e| {
                    warn!("failed to requeue delivery {}: {}", self.delivery_tag, e);
                    AckError::Other(e.to_string())
                })?;
        }

        Ok(())
    }
}
