use crate::error::AckError;
use crate::message::Message;

use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// Stream of deliveries produced by [`Broker::consume`](crate::Broker::consume).
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Debug + Send + Sync + 'static {
    /// Positively acknowledges the delivery.
    async fn ack(&self) -> Result<(), AckError>;

    /// Rejects the delivery, optionally returning it to the queue.
    async fn nack(&self, requeue: bool) -> Result<(), AckError>;
}

/// A message handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    acker: Box<dyn Acker>,
    delivery_tag: u64,
    message: Message,
    redelivered: bool,
}

impl Delivery {
    /// Creates a new delivery.
    #[must_use]
    pub fn new(message: Message, delivery_tag: u64, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            acker,
            delivery_tag,
            message,
            redelivered,
        }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Broker assigned tag, unique per consumer.
    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether this message was delivered before and not acknowledged.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled or the channel is gone.
    pub async fn ack(self) -> Result<(), AckError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery was already settled or the channel is gone.
    pub async fn nack(self, requeue: bool) -> Result<(), AckError> {
        self.acker.nack(requeue).await
    }
}
