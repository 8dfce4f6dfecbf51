use mqrpc_core::{Code, Status};
use thiserror::Error;

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the channel itself, as opposed to the outcome of a call.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker error.
    #[error("broker error: {0}")]
    Broker(String),

    /// The call has not reached a terminal state yet.
    #[error("unable to get the status because the call is not complete")]
    CallNotComplete,
}

/// Failed outcome of a call.
///
/// Cancellation-shaped outcomes (caller cancellation, deadline, channel
/// shutdown) are kept apart from statuses reported by the server so callers
/// can branch on them without looking at messages.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The call was cancelled or ran out of time.
    #[error("call cancelled: {0}")]
    Cancelled(Status),

    /// The call completed with a non-OK status.
    #[error("call failed: {0}")]
    Failed(Status),
}

impl CallError {
    /// The status behind the failure.
    #[must_use]
    pub const fn status(&self) -> &Status {
        match self {
            Self::Cancelled(status) | Self::Failed(status) => status,
        }
    }

    /// The status code behind the failure.
    #[must_use]
    pub const fn code(&self) -> Code {
        self.status().code()
    }

    /// Whether the call was cancelled rather than failed.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<CallError> for Status {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Cancelled(status) | CallError::Failed(status) => status,
        }
    }
}
