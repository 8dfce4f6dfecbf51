//! Shared building blocks for RPC over a message broker: status codes, wire
//! envelopes, serialization adapters, method descriptors, per-call
//! cancellation and compression.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Composite per-call cancellation.
pub mod cancellation;

/// Compression providers for message bodies.
pub mod compression;

/// Request and response envelopes carried as broker message bodies.
pub mod envelope;

mod error;

/// Serialization adapters between typed messages and byte payloads.
pub mod marshaller;

/// Method descriptors.
pub mod method;

/// Protocol constants.
pub mod protocol;

/// Status codes.
pub mod status;

pub use cancellation::CallCancellation;
pub use compression::{
    CompressionLevel, CompressionProvider, GZIP_ENCODING, GzipCompressionProvider,
};
pub use envelope::{Headers, RequestEnvelope, ResponseEnvelope};
pub use error::{Error, Result};
pub use marshaller::{DeserializationContext, Marshaller, SerializationContext};
pub use method::{Method, MethodDescriptor, MethodKind};
pub use status::{Code, Status};
