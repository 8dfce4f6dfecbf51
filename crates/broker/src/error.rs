use thiserror::Error;

/// Errors that can occur while settling a delivery.
#[derive(Debug, Error)]
pub enum AckError {
    /// The delivery was already acknowledged or rejected.
    #[error("delivery {0} already settled")]
    AlreadySettled(u64),

    /// The channel the delivery came from is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// Broker specific failure.
    #[error("ack failed: {0}")]
    Other(String),
}
