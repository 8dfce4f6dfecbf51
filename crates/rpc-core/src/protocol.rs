use std::time::Duration;

/// Content type of a request envelope.
pub const REQUEST_CONTENT_TYPE: &str = "application/cbor; messageType=\"mqrpc.RpcRequest\"";

/// Content type of a response envelope.
pub const RESPONSE_CONTENT_TYPE: &str = "application/cbor; messageType=\"mqrpc.RpcResponse\"";

/// Queue servers listen on unless configured otherwise.
pub const DEFAULT_REQUEST_QUEUE: &str = "rpc_queue";

/// Header naming the encoding of a compressed body.
pub const ENCODING_HEADER: &str = "grpc-encoding";

/// Header listing the encodings a peer can decompress.
pub const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// The "no compression" encoding.
pub const IDENTITY_ENCODING: &str = "identity";

/// Longest timeout a call may carry. Larger values are clamped.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(99_999_999);

/// Default cap on received message size.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
