use crate::context::ServerCallContext;
use crate::error::{Error, Result};
use crate::registry::{LookupError, MethodRegistry};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use mqrpc_broker::{
    Broker, ConsumeOptions, Delivery, DeliveryStream, Message, MessageProperties, QueueOptions,
};
use mqrpc_core::protocol::{DEFAULT_REQUEST_QUEUE, RESPONSE_CONTENT_TYPE};
use mqrpc_core::{CallCancellation, RequestEnvelope, ResponseEnvelope, Status};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Options for a [`RpcListener`].
#[derive(Clone, Debug)]
pub struct ListenerOptions {
    /// Whether the request queue survives a broker restart.
    pub durable: bool,

    /// Unacknowledged messages each worker may hold.
    pub prefetch: u16,

    /// Request queue to consume.
    pub queue: String,

    /// Number of parallel workers.
    pub workers: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            durable: false,
            prefetch: 1,
            queue: DEFAULT_REQUEST_QUEUE.to_string(),
            workers: 4,
        }
    }
}

impl ListenerOptions {
    /// Sets whether the request queue is durable.
    #[must_use]
    pub const fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the per-worker prefetch.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the request queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Consumes request envelopes from a queue and dispatches them to the
/// registered handlers, publishing each response to the request's reply-to.
#[derive(Debug)]
pub struct RpcListener<B>
where
    B: Broker,
{
    broker: B,
    options: ListenerOptions,
    registry: Arc<MethodRegistry>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<B> RpcListener<B>
where
    B: Broker,
{
    /// Creates a listener. Nothing is consumed until [`Self::start`].
    #[must_use]
    pub fn new(broker: B, registry: Arc<MethodRegistry>, options: ListenerOptions) -> Self {
        Self {
            broker,
            options,
            registry,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> String {
        format!("rpc listener ({})", self.options.queue)
    }

    /// Declares the request queue and starts the workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or a broker error
    /// if the queue cannot be declared or consumed.
    #[instrument(skip(self), fields(queue = %self.options.queue))]
    pub async fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let queue = self
            .broker
            .declare_queue(
                QueueOptions::named(&self.options.queue).with_durable(self.options.durable),
            )
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        // Every consumer is opened before any worker runs. If one fails the
        // streams opened so far are dropped and `start` may be retried.
        let mut consumers = Vec::with_capacity(self.options.workers);
        for _ in 0..self.options.workers {
            let deliveries = self
                .broker
                .consume(
                    &queue,
                    ConsumeOptions::default().with_prefetch(self.options.prefetch),
                )
                .await
                .map_err(|e| Error::Broker(e.to_string()))?;
            consumers.push(deliveries);
        }

        for (id, deliveries) in consumers.into_iter().enumerate() {
            let worker = Worker {
                broker: self.broker.clone(),
                id,
                registry: Arc::clone(&self.registry),
                shutdown_token: self.shutdown_token.clone(),
            };

            self.task_tracker.spawn(worker.run(deliveries));
        }

        self.task_tracker.close();

        info!(
            "{} started with {} workers",
            self.name(),
            self.options.workers
        );

        Ok(())
    }

    /// Stops the workers and waits for in-flight calls to finish.
    ///
    /// Calls still running observe cancellation; their replies are not
    /// published and their requests go back to the queue.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for parity with other services.
    #[instrument(skip(self), fields(queue = %self.options.queue))]
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down {}...", self.name());

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("{} shutdown", self.name());

        Ok(())
    }

    /// Waits for the workers to exit.
    pub async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}

struct Worker<B> {
    broker: B,
    id: usize,
    registry: Arc<MethodRegistry>,
    shutdown_token: CancellationToken,
}

impl<B> Worker<B>
where
    B: Broker,
{
    async fn run(self, mut deliveries: DeliveryStream) {
        debug!("worker {} started", self.id);

        loop {
            let delivery = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => break,
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!("worker {}: delivery stream ended", self.id);
                        break;
                    }
                },
            };

            self.process(delivery).await;
        }

        debug!("worker {} stopped", self.id);
    }

    #[instrument(skip_all, fields(worker = self.id, delivery_tag = delivery.delivery_tag()))]
    async fn process(&self, delivery: Delivery) {
        let properties = delivery.message().properties.clone();

        let response = match RequestEnvelope::decode(&delivery.message().body) {
            Ok(request) => self.dispatch(request, &properties).await,
            Err(e) => {
                warn!("failed to parse request envelope: {}", e);
                ResponseEnvelope::failure(Status::internal("Failed to parse request envelope"))
            }
        };

        if self.shutdown_token.is_cancelled() {
            debug!("shutdown requested, returning request to the queue");
            if let Err(e) = delivery.nack(true).await {
                warn!("failed to return request to the queue: {}", e);
            }
            return;
        }

        match properties.reply_to.as_deref() {
            Some(reply_to) => {
                if let Err(e) = self
                    .reply(reply_to, properties.correlation_id, &response)
                    .await
                {
                    error!("failed to publish reply to {}: {}", reply_to, e);
                }
            }
            None => warn!("request has no reply-to, dropping response"),
        }

        if let Err(e) = delivery.ack().await {
            warn!("failed to acknowledge request: {}", e);
        }
    }

    async fn dispatch(
        &self,
        request: RequestEnvelope,
        properties: &MessageProperties,
    ) -> ResponseEnvelope {
        let handler = match self
            .registry
            .lookup(&request.service_name, &request.method_name)
        {
            Ok(handler) => handler,
            Err(e) => {
                match &e {
                    LookupError::UnknownService(service) => {
                        warn!("service {} is unimplemented", service);
                    }
                    LookupError::UnknownMethod { service, method } => {
                        warn!("method {} of service {} is unimplemented", method, service);
                    }
                }
                return ResponseEnvelope::failure(e.into());
            }
        };

        let mut cancellation = CallCancellation::linked_to(&self.shutdown_token);
        if let Some(expiration) = properties.expiration_duration() {
            cancellation = cancellation.with_timeout(expiration);
        }

        let context = ServerCallContext::new(
            handler.method().clone(),
            Arc::clone(handler.options()),
            request.headers.clone(),
            cancellation.token().clone(),
        )
        .with_correlation_id(properties.correlation_id.clone())
        .with_deadline(cancellation.deadline())
        .with_user_id(properties.user_id.clone());

        let response = AssertUnwindSafe(handler.handle_call(request, Arc::new(context)))
            .catch_unwind()
            .await;

        response.unwrap_or_else(|_| {
            error!("panic escaped the call handler");
            ResponseEnvelope::failure(Status::internal("Call handler panicked"))
        })
    }

    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: Option<String>,
        response: &ResponseEnvelope,
    ) -> Result<()> {
        let mut properties = MessageProperties::default()
            .with_content_type(RESPONSE_CONTENT_TYPE)
            .with_timestamp_now();
        properties.correlation_id = correlation_id;
        properties.headers.clone_from(&response.headers);

        let message = Message::new(response.encode()?).with_properties(properties);

        self.broker
            .publish(reply_to, message)
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }
}
