use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Broker error.
    #[error("broker error: {0}")]
    Broker(String),

    /// A call failed.
    #[error(transparent)]
    Call(#[from] mqrpc_client::CallError),

    /// Client channel error.
    #[error(transparent)]
    Client(#[from] mqrpc_client::Error),

    /// Server error.
    #[error(transparent)]
    Server(#[from] mqrpc_server::Error),

    /// Could not install the signal handler.
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}
