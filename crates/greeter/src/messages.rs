use serde::{Deserialize, Serialize};

/// Who to greet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HelloRequest {
    /// Name of the caller.
    pub name: String,
}

/// A greeting.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HelloReply {
    /// The greeting text.
    pub message: String,
}

/// Which Fibonacci number to compute.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FibRequest {
    /// Index into the sequence, at most [`MAX_FIB`](crate::services::MAX_FIB).
    pub max: u32,
}

/// The Fibonacci number at index `max`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FibReply {
    /// `Fib(max)`, with `Fib(0) = 0` and `Fib(1) = 1`.
    pub number: u64,
}
