use std::sync::Arc;
use std::time::Duration;

use mqrpc_core::cancellation::far_future;
use mqrpc_core::compression::default_providers;
use mqrpc_core::protocol::DEFAULT_REQUEST_QUEUE;
use mqrpc_core::{CompressionProvider, Headers};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for a [`RpcChannel`](crate::RpcChannel).
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Encodings the channel can decompress. Advertised on every request.
    pub compression_providers: Vec<Arc<dyn CompressionProvider>>,

    /// Skip the local deadline timer. The expiration is still sent.
    pub disable_deadline: bool,

    /// Longest single sleep of the deadline timer. Longer deadlines are
    /// reached by rescheduling.
    pub max_timer_due: Duration,

    /// Request queue calls are published to.
    pub queue: String,

    /// Upper bound applied to every call. `None` leaves calls without a
    /// deadline unbounded.
    pub timeout: Option<Duration>,

    /// Identity attached to outbound requests.
    pub user_id: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            compression_providers: default_providers(),
            disable_deadline: false,
            max_timer_due: Duration::from_millis(u64::from(u32::MAX - 1)),
            queue: DEFAULT_REQUEST_QUEUE.to_string(),
            timeout: Some(Duration::from_secs(100)),
            user_id: None,
        }
    }
}

impl ChannelOptions {
    /// Sets the compression providers.
    #[must_use]
    pub fn with_compression_providers(
        mut self,
        providers: Vec<Arc<dyn CompressionProvider>>,
    ) -> Self {
        self.compression_providers = providers;
        self
    }

    /// Sets whether the local deadline timer is skipped.
    #[must_use]
    pub const fn with_disable_deadline(mut self, disable_deadline: bool) -> Self {
        self.disable_deadline = disable_deadline;
        self
    }

    /// Sets the longest single sleep of the deadline timer.
    #[must_use]
    pub const fn with_max_timer_due(mut self, max_timer_due: Duration) -> Self {
        self.max_timer_due = max_timer_due;
        self
    }

    /// Sets the request queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the channel timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the issuing identity.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Per-call options.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Caller cancellation.
    pub cancellation_token: Option<CancellationToken>,

    /// Absolute deadline.
    pub deadline: Option<Instant>,

    /// Request headers.
    pub headers: Headers,
}

impl CallOptions {
    /// Options with no deadline, token or headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the call when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Sets an absolute deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        self.with_deadline(deadline)
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}
