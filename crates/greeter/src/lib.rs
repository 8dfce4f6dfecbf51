//! Demo services served over a message broker: a greeter and a Fibonacci
//! calculator.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Call logging interceptor.
pub mod interceptor;

/// Request and reply messages.
pub mod messages;

/// Service implementations and their method definitions.
pub mod services;
