use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while moving messages in and out of byte payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload was completed twice.
    #[error("serialization context already completed")]
    AlreadyCompleted,

    /// Compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression failed.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Deserialization failed.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Envelope bytes could not be decoded.
    #[error("malformed {kind} envelope: {reason}")]
    MalformedEnvelope {
        /// Which envelope was expected.
        kind: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// Marshaller returned without completing the payload.
    #[error("serialization context not completed")]
    NotCompleted,

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
}
