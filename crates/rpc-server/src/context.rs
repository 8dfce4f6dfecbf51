use crate::options::MethodOptions;

use std::fmt;
use std::sync::Arc;

use mqrpc_core::{Headers, MethodDescriptor, Status};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Where a server call is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallState {
    /// Context built, nothing run yet.
    Created,
    /// Request headers are available.
    HeadersInitialized,
    /// The method (and its interceptors) is running.
    Invoking,
    /// The response was encoded.
    Succeeded,
    /// The call failed; the status holds the reason.
    Faulted,
    /// The response envelope is final.
    Completed,
}

/// Per-invocation state shared by interceptors and the application method.
pub struct ServerCallContext {
    cancellation: CancellationToken,
    correlation_id: Option<String>,
    deadline: Option<Instant>,
    method: MethodDescriptor,
    options: Arc<MethodOptions>,
    request_headers: Headers,
    response_headers: Mutex<Headers>,
    state: Mutex<CallState>,
    status: Mutex<Status>,
    user_id: Option<String>,
}

impl ServerCallContext {
    /// Creates a context for one call.
    pub fn new(
        method: MethodDescriptor,
        options: Arc<MethodOptions>,
        request_headers: Headers,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            cancellation,
            correlation_id: None,
            deadline: None,
            method,
            options,
            request_headers,
            response_headers: Mutex::new(Headers::new()),
            state: Mutex::new(CallState::Created),
            status: Mutex::new(Status::ok()),
            user_id: None,
        }
    }

    /// Sets the correlation id of the inbound message.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Sets the deadline derived from the message expiration.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the identity of the caller.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// The method being called.
    #[must_use]
    pub const fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Options resolved for the method.
    #[must_use]
    pub fn options(&self) -> &MethodOptions {
        &self.options
    }

    /// Token cancelled on deadline or server shutdown.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the call has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Deadline of the call, if the caller set one.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Correlation id of the request message.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Identity the caller published with.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Request headers.
    #[must_use]
    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    /// First request header with the given key, ignoring case.
    #[must_use]
    pub fn request_header(&self, key: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Adds a header to the response.
    pub fn add_response_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.response_headers.lock().push((key.into(), value.into()));
    }

    /// Response headers added so far.
    #[must_use]
    pub fn response_headers(&self) -> Headers {
        self.response_headers.lock().clone()
    }

    /// Current status of the call.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status.lock().clone()
    }

    /// Overrides the status of the call.
    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub(crate) fn transition(&self, to: CallState) {
        let mut state = self.state.lock();
        trace!(
            "call {} moving from {:?} to {:?}",
            self.method.full_name(),
            *state,
            to
        );
        *state = to;
    }
}

impl fmt::Debug for ServerCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallContext")
            .field("method", &self.method.full_name())
            .field("correlation_id", &self.correlation_id)
            .field("deadline", &self.deadline)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
