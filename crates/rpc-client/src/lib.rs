//! Client side of RPC over a message broker.
//!
//! A [`RpcChannel`] publishes request envelopes to the service queue and
//! matches replies arriving on its private reply queue to the calls waiting
//! for them. Each call carries its own deadline and cancellation; the first
//! of reply, deadline or cancellation settles it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Client calls.
pub mod call;

/// Client channel.
pub mod channel;

/// Deadline timer.
pub mod deadline;

mod error;

/// Channel and call options.
pub mod options;

/// Pending call table.
pub mod pending;

pub use call::{AsyncUnaryCall, ClientCallState};
pub use channel::RpcChannel;
pub use error::{CallError, Error, Result};
pub use options::{CallOptions, ChannelOptions};
pub use pending::PendingCallTable;
