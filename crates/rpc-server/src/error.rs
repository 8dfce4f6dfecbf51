use mqrpc_core::Status;
use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the server.
#[derive(Debug, Error)]
pub enum Error {
    /// A service instance could not be created.
    #[error("failed to activate service: {0}")]
    ActivationFailed(String),

    /// The listener was already started.
    #[error("listener already started")]
    AlreadyStarted,

    /// Broker operation failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Envelope or payload codec failure.
    #[error(transparent)]
    Codec(#[from] mqrpc_core::Error),

    /// A method was registered twice.
    #[error("method '{method}' of service '{service}' is already registered")]
    DuplicateRegistration {
        /// Service name.
        service: String,
        /// Full method name.
        method: String,
    },

    /// An interceptor could not be constructed. This is a configuration error.
    #[error("could not construct interceptor instance for type {0}")]
    InterceptorConstructionFailed(String),

    /// The configured response compression algorithm has no provider.
    #[error(
        "the configured response compression algorithm '{0}' does not have a matching compression provider"
    )]
    UnknownCompressionAlgorithm(String),
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        Self::internal(error.to_string())
    }
}
