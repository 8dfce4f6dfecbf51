use mqrpc_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker was closed.
    #[error("broker closed")]
    Closed,

    /// Another consumer holds the queue exclusively.
    #[error("queue '{0}' is in exclusive use")]
    ExclusiveInUse(String),

    /// A queue was redeclared with different options.
    #[error("queue '{0}' already declared with different options")]
    PreconditionFailed(String),

    /// No queue with the given name.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),
}

impl BrokerError for Error {}
