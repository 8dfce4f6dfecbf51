//! Server side of RPC over a message broker.
//!
//! Services bind their methods into a [`MethodRegistry`], optionally wrapped
//! by interceptors. A [`RpcListener`] consumes request envelopes from a queue
//! with a fixed number of workers, dispatches each to its [`CallHandler`] and
//! publishes the response envelope to the request's reply-to queue.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Service instance activation.
pub mod activator;

/// Per-call server context.
pub mod context;

mod error;

/// Call handlers per call kind.
pub mod handler;

/// Interceptors and their registrations.
pub mod interceptor;

/// Method invokers per call kind.
pub mod invoker;

/// Broker listener.
pub mod listener;

/// Service and method options.
pub mod options;

/// Interceptor pipeline composition.
pub mod pipeline;

/// Method registry and service binding.
pub mod registry;

pub use activator::{ActivatorHandle, PerCallActivator, ServiceActivator, SingletonActivator};
pub use context::{CallState, ServerCallContext};
pub use error::{Error, Result};
pub use handler::CallHandler;
pub use interceptor::{
    AnyMessage, Interceptor, InterceptorRegistration, RequestStream, ResponseWriter, downcast,
};
pub use listener::{ListenerOptions, RpcListener};
pub use options::{MethodOptions, ServiceOptions};
pub use registry::{LookupError, MethodRegistry, ServiceBinder};
