//! Abstract interface for the point-to-point message broker RPC calls travel over.
//!
//! The runtime only needs a handful of broker operations: declaring queues,
//! consuming with a bounded prefetch window and manual acknowledgement, and
//! publishing messages that carry transport properties. Concrete brokers live
//! in their own crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Deliveries hand consumed messages to workers and settle them.
pub mod delivery;

/// Errors shared by every broker implementation.
pub mod error;

/// Messages and the transport properties they carry.
pub mod message;

/// Queue declaration and consumption options.
pub mod options;

pub use delivery::{Acker, Delivery, DeliveryStream};
pub use error::AckError;
pub use message::{Message, MessageProperties};
pub use options::{ConsumeOptions, QueueOptions};

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for broker errors
pub trait BrokerError: Error + Send + Sync + 'static {}

/// A connection to a message broker.
///
/// Implementations are cheap to clone; clones share the same underlying
/// connection.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// Declares a queue and returns its name.
    ///
    /// An empty name in `options` asks the broker to pick a unique name.
    async fn declare_queue(&self, options: QueueOptions) -> Result<String, Self::Error>;

    /// Starts consuming from a queue.
    ///
    /// Deliveries must be settled with [`Delivery::ack`] or [`Delivery::nack`]
    /// unless `options.auto_ack` is set.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Self::Error>;

    /// Publishes a message to a queue.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), Self::Error>;

    /// Deletes a queue and drops anything still in it.
    async fn delete_queue(&self, queue: &str) -> Result<(), Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;
}
