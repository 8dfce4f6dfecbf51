use mqrpc_broker::BrokerError;
use thiserror::Error;

/// Errors from the NATS broker.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not connect to the server.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// Could not flush pending messages.
    #[error("failed to flush: {0}")]
    Flush(String),

    /// Could not publish a message.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// Could not subscribe to a queue.
    #[error("failed to subscribe: {0}")]
    Subscribe(String),
}

impl BrokerError for Error {}
