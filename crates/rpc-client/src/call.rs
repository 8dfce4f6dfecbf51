use crate::deadline::DeadlineTimer;
use crate::error::{CallError, Error, Result};
use crate::options::{CallOptions, ChannelOptions};
use crate::pending::PendingCallTable;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use mqrpc_broker::{Broker, Message, MessageProperties};
use mqrpc_core::compression::{accept_encoding, find_provider};
use mqrpc_core::protocol::{
    ACCEPT_ENCODING_HEADER, ENCODING_HEADER, IDENTITY_ENCODING, MAX_TIMEOUT, REQUEST_CONTENT_TYPE,
};
use mqrpc_core::{CallCancellation, Code, Method, RequestEnvelope, ResponseEnvelope, Status};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a client call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientCallState {
    /// Not yet published.
    Created,
    /// Request published.
    Sent,
    /// Waiting for the reply, the deadline or cancellation.
    AwaitingReply,
    /// A reply arrived, or the call failed locally.
    Completed,
    /// Cancelled by the caller or by channel shutdown.
    Cancelled,
    /// The deadline passed first.
    DeadlineExceeded,
    /// The call handle was released after reaching a terminal state.
    Disposed,
}

/// State shared by every call on one channel.
#[derive(Debug)]
pub(crate) struct ChannelShared<B> {
    pub broker: B,
    pub options: ChannelOptions,
    pub pending: PendingCallTable,
    pub reply_queue: String,
    pub shutdown_token: CancellationToken,
}

#[derive(Debug)]
struct Progress {
    state: ClientCallState,
    status: Option<Status>,
}

#[derive(Debug)]
struct CallProgress(Mutex<Progress>);

impl CallProgress {
    const fn new() -> Self {
        Self(Mutex::new(Progress {
            state: ClientCallState::Created,
            status: None,
        }))
    }

    fn transition(&self, state: ClientCallState) {
        self.0.lock().state = state;
    }

    fn finish(&self, state: ClientCallState, status: Status) {
        let mut progress = self.0.lock();
        progress.state = state;
        progress.status = Some(status);
    }

    fn dispose(&self) {
        let mut progress = self.0.lock();
        if progress.status.is_some() {
            progress.state = ClientCallState::Disposed;
        }
    }

    fn state(&self) -> ClientCallState {
        self.0.lock().state
    }

    fn status(&self) -> Option<Status> {
        self.0.lock().status.clone()
    }
}

/// Cancels the call when the handle goes away.
#[derive(Debug)]
struct CallGuard {
    progress: Arc<CallProgress>,
    token: CancellationToken,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.progress.dispose();
    }
}

/// Handle to an in-flight unary call.
///
/// The call runs in the background once started. Dropping the handle before
/// the call completes cancels it.
pub struct AsyncUnaryCall<Res> {
    correlation_id: String,
    guard: CallGuard,
    task: JoinHandle<std::result::Result<Res, CallError>>,
}

impl<Res> AsyncUnaryCall<Res> {
    /// Correlation id carried by the request and its reply.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ClientCallState {
        self.guard.progress.state()
    }

    /// Final status of the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallNotComplete`] while the call is still running.
    pub fn status(&self) -> Result<Status> {
        self.guard.progress.status().ok_or(Error::CallNotComplete)
    }

    /// Cancels the call. Has no effect once it completed.
    pub fn cancel(&self) {
        self.guard.token.cancel();
    }

    /// Waits for the response.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Cancelled`] when the call was cancelled or its
    /// deadline passed, and [`CallError::Failed`] for any other non-OK status.
    pub async fn response(self) -> std::result::Result<Res, CallError> {
        let Self { task, guard, .. } = self;

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(CallError::Failed(Status::internal(format!(
                "Call task failed: {e}"
            )))),
        };

        drop(guard);
        outcome
    }
}

impl<Res> fmt::Debug for AsyncUnaryCall<Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncUnaryCall")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Starts a unary call in the background.
pub(crate) fn start_unary<B, Req, Res>(
    shared: Arc<ChannelShared<B>>,
    method: &Method<Req, Res>,
    request: &Req,
    options: CallOptions,
) -> AsyncUnaryCall<Res>
where
    B: Broker,
    Req: 'static,
    Res: Send + 'static,
{
    let correlation_id = Uuid::new_v4().to_string();
    let progress = Arc::new(CallProgress::new());
    let token = CancellationToken::new();

    let call = UnaryCall {
        body: method.serialize_request(request),
        correlation_id: correlation_id.clone(),
        method: method.clone(),
        options,
        progress: Arc::clone(&progress),
        shared,
        token: token.clone(),
    };

    AsyncUnaryCall {
        correlation_id,
        guard: CallGuard { progress, token },
        task: tokio::spawn(call.run()),
    }
}

struct UnaryCall<B, Req, Res> {
    body: mqrpc_core::Result<Bytes>,
    correlation_id: String,
    method: Method<Req, Res>,
    options: CallOptions,
    progress: Arc<CallProgress>,
    shared: Arc<ChannelShared<B>>,
    token: CancellationToken,
}

type Outcome<Res> = std::result::Result<Res, CallError>;

impl<B, Req, Res> UnaryCall<B, Req, Res>
where
    B: Broker,
    Req: 'static,
    Res: Send + 'static,
{
    #[instrument(skip_all, fields(method = %self.method.full_name(), correlation_id = %self.correlation_id))]
    async fn run(self) -> Outcome<Res> {
        if self.shared.shutdown_token.is_cancelled() {
            return self.fail(Status::unavailable("Channel is shut down."));
        }

        let now = Instant::now();
        let (deadline, timeout) = self.deadline(now);
        let local_deadline = deadline.filter(|_| !self.shared.options.disable_deadline);

        if local_deadline.is_some_and(|d| d <= now) {
            // Started with a deadline in the past.
            return self.deadline_exceeded();
        }

        let request = match self.request() {
            Ok(request) => request,
            Err(status) => return self.fail(status),
        };

        let mut cancellation =
            CallCancellation::linked_to(&self.shared.shutdown_token).with_link(&self.token);
        if let Some(caller) = &self.options.cancellation_token {
            cancellation = cancellation.with_link(caller);
        }

        if cancellation.is_cancelled() {
            // Nothing was sent, so there is nothing to unregister.
            return self.interrupted(local_deadline);
        }

        let mut receiver = self.shared.pending.insert(self.correlation_id.clone());
        if let Err(status) = self.publish(request, timeout).await {
            self.shared.pending.remove(&self.correlation_id);
            return self.fail(status);
        }
        self.progress.transition(ClientCallState::Sent);

        let _timer = local_deadline.map(|deadline| {
            DeadlineTimer::start(
                deadline,
                self.shared.options.max_timer_due,
                cancellation.token().clone(),
            )
        });
        self.progress.transition(ClientCallState::AwaitingReply);

        tokio::select! {
            biased;
            reply = &mut receiver => self.settle(reply, local_deadline),
            () = cancellation.cancelled() => {
                if !self.shared.pending.remove(&self.correlation_id) {
                    // The reply won the race and is already on its way.
                    let reply = receiver.await;
                    return self.settle(reply, local_deadline);
                }

                self.interrupted(local_deadline)
            }
        }
    }

    /// Outcome of a call whose cancellation fired before any reply.
    fn interrupted(&self, local_deadline: Option<Instant>) -> Outcome<Res> {
        if local_deadline.is_some_and(|d| d <= Instant::now()) {
            self.deadline_exceeded()
        } else if self.shared.shutdown_token.is_cancelled() {
            self.cancelled(Status::cancelled("Channel shut down."))
        } else {
            debug!("call canceled by the client");
            self.cancelled(Status::cancelled("Call canceled by the client."))
        }
    }

    /// The effective deadline and the timeout sent as expiration.
    fn deadline(&self, now: Instant) -> (Option<Instant>, Option<std::time::Duration>) {
        let channel = self
            .shared
            .options
            .timeout
            .and_then(|timeout| now.checked_add(timeout));
        let deadline = match (self.options.deadline, channel) {
            (Some(call), Some(channel)) => Some(call.min(channel)),
            (call, channel) => call.or(channel),
        };

        let Some(deadline) = deadline else {
            return (None, None);
        };

        let timeout = deadline.saturating_duration_since(now);
        if timeout > MAX_TIMEOUT {
            debug!(
                "deadline timeout {:?} is above maximum allowed timeout of {:?}, maximum timeout will be used",
                timeout, MAX_TIMEOUT
            );
            return (Some(now + MAX_TIMEOUT), Some(MAX_TIMEOUT));
        }

        (Some(deadline), Some(timeout))
    }

    fn request(&self) -> std::result::Result<RequestEnvelope, Status> {
        let body = match &self.body {
            Ok(body) => body.clone(),
            Err(e) => {
                warn!("failed to serialize request: {}", e);
                return Err(Status::internal("Failed to serialize request message."));
            }
        };

        let mut request = RequestEnvelope::new(
            self.method.service_name(),
            self.method.full_name(),
            body,
        );
        request.headers.clone_from(&self.options.headers);

        let providers = &self.shared.options.compression_providers;
        if !providers.is_empty() {
            request = request.with_header(ACCEPT_ENCODING_HEADER, accept_encoding(providers));
        }

        Ok(request)
    }

    async fn publish(
        &self,
        request: RequestEnvelope,
        timeout: Option<std::time::Duration>,
    ) -> std::result::Result<(), Status> {
        let body = request.encode().map_err(|e| {
            warn!("failed to encode request envelope: {}", e);
            Status::internal("Failed to serialize request message.")
        })?;

        let mut properties = MessageProperties::default()
            .with_content_type(REQUEST_CONTENT_TYPE)
            .with_correlation_id(self.correlation_id.as_str())
            .with_reply_to(self.shared.reply_queue.as_str())
            .with_timestamp_now();
        if let Some(timeout) = timeout {
            properties = properties.with_expiration(timeout);
        }
        if let Some(user_id) = &self.shared.options.user_id {
            properties = properties.with_user_id(user_id.as_str());
        }

        self.shared
            .broker
            .publish(
                &self.shared.options.queue,
                Message::new(body).with_properties(properties),
            )
            .await
            .map_err(|e| {
                warn!("failed to publish request: {}", e);
                Status::unavailable(format!("Error publishing request: {e}"))
            })?;

        debug!("request published to {}", self.shared.options.queue);
        Ok(())
    }

    fn settle(
        &self,
        reply: std::result::Result<ResponseEnvelope, oneshot::error::RecvError>,
        deadline: Option<Instant>,
    ) -> Outcome<Res> {
        let Ok(response) = reply else {
            return self.cancelled(Status::cancelled("Channel shut down."));
        };

        let status = response.status.clone();
        if status.is_ok() {
            return match self.decode(response) {
                Ok(value) => {
                    self.progress.finish(ClientCallState::Completed, Status::ok());
                    Ok(value)
                }
                Err(status) => self.fail(status),
            };
        }

        let status = if status.code() == Code::Cancelled
            && deadline.is_some_and(|d| d <= Instant::now())
        {
            // The local clock decides between the two.
            Status::new(Code::DeadlineExceeded, status.message())
        } else {
            status
        };

        if status.code() == Code::DeadlineExceeded {
            self.progress.finish(ClientCallState::DeadlineExceeded, status.clone());
            return Err(CallError::Cancelled(status));
        }

        self.fail(status)
    }

    fn decode(&self, response: ResponseEnvelope) -> std::result::Result<Res, Status> {
        let mut body = response.body.clone().unwrap_or_default();

        if let Some(encoding) = response.header(ENCODING_HEADER) {
            if !encoding.eq_ignore_ascii_case(IDENTITY_ENCODING) {
                let provider =
                    find_provider(&self.shared.options.compression_providers, encoding)
                        .ok_or_else(|| {
                            Status::internal(format!(
                                "Unsupported grpc-encoding value '{encoding}'."
                            ))
                        })?;
                body = provider.decompress(&body).map_err(|e| {
                    warn!("failed to decompress response: {}", e);
                    Status::internal("Failed to decompress response message.")
                })?;
            }
        }

        self.method.deserialize_response(body).map_err(|e| {
            warn!("failed to deserialize response: {}", e);
            Status::internal("Failed to deserialize response message.")
        })
    }

    fn fail(&self, status: Status) -> Outcome<Res> {
        self.progress.finish(ClientCallState::Completed, status.clone());
        Err(CallError::Failed(status))
    }

    fn cancelled(&self, status: Status) -> Outcome<Res> {
        self.progress.finish(ClientCallState::Cancelled, status.clone());
        Err(CallError::Cancelled(status))
    }

    fn deadline_exceeded(&self) -> Outcome<Res> {
        debug!("deadline exceeded");
        let status = Status::deadline_exceeded("Deadline Exceeded");
        self.progress.finish(ClientCallState::DeadlineExceeded, status.clone());
        Err(CallError::Cancelled(status))
    }
}
