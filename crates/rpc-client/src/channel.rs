use crate::call::{AsyncUnaryCall, ChannelShared, start_unary};
use crate::error::{CallError, Error, Result};
use crate::options::{CallOptions, ChannelOptions};
use crate::pending::PendingCallTable;

use std::sync::Arc;

use futures::StreamExt;
use mqrpc_broker::{Broker, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use mqrpc_core::{Method, ResponseEnvelope, Status};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// A client connection to RPC services behind a broker.
///
/// Owns a private reply queue and a background loop matching replies to
/// pending calls by correlation id. Cheap to clone; clones share the reply
/// queue and may issue calls concurrently.
#[derive(Clone, Debug)]
pub struct RpcChannel<B>
where
    B: Broker,
{
    shared: Arc<ChannelShared<B>>,
    task_tracker: TaskTracker,
}

impl<B> RpcChannel<B>
where
    B: Broker,
{
    /// Declares the reply queue and starts receiving replies.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the reply queue cannot be declared or consumed.
    #[instrument(skip_all, fields(queue = %options.queue))]
    pub async fn connect(broker: B, options: ChannelOptions) -> Result<Self> {
        let reply_queue = broker
            .declare_queue(QueueOptions::server_named())
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        let replies = broker
            .consume(
                &reply_queue,
                ConsumeOptions::default()
                    .with_auto_ack(true)
                    .with_exclusive(true),
            )
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        let shared = Arc::new(ChannelShared {
            broker,
            options,
            pending: PendingCallTable::new(),
            reply_queue,
            shutdown_token: CancellationToken::new(),
        });

        let task_tracker = TaskTracker::new();
        task_tracker.spawn(receive_replies(
            replies,
            shared.pending.clone(),
            shared.shutdown_token.clone(),
        ));
        task_tracker.close();

        info!("rpc channel receiving replies on {}", shared.reply_queue);

        Ok(Self {
            shared,
            task_tracker,
        })
    }

    /// Name of the private reply queue.
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.shared.reply_queue
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// The channel's options.
    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.shared.options
    }

    /// Starts a unary call and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_unary_call<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        request: &Req,
        options: CallOptions,
    ) -> AsyncUnaryCall<Res>
    where
        Req: 'static,
        Res: Send + 'static,
    {
        start_unary(Arc::clone(&self.shared), method, request, options)
    }

    /// Makes a unary call and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Cancelled`] when the call was cancelled or its
    /// deadline passed, and [`CallError::Failed`] for any other non-OK status.
    pub async fn unary_call<Req, Res>(
        &self,
        method: &Method<Req, Res>,
        request: &Req,
        options: CallOptions,
    ) -> std::result::Result<Res, CallError>
    where
        Req: 'static,
        Res: Send + 'static,
    {
        self.start_unary_call(method, request, options)
            .response()
            .await
    }

    /// Stops receiving replies, cancels in-flight calls and deletes the
    /// reply queue. Later calls fail with `Unavailable`.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for parity with the listener.
    #[instrument(skip(self), fields(reply_queue = %self.shared.reply_queue))]
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down rpc channel...");

        self.shared.shutdown_token.cancel();
        self.task_tracker.wait().await;

        let abandoned = self.shared.pending.fail_all();
        if abandoned > 0 {
            debug!("cancelled {} in-flight calls", abandoned);
        }

        if let Err(e) = self
            .shared
            .broker
            .delete_queue(&self.shared.reply_queue)
            .await
        {
            // Auto-delete may already have removed it.
            debug!("could not delete reply queue: {}", e);
        }

        info!("rpc channel shutdown");

        Ok(())
    }
}

async fn receive_replies(
    mut replies: DeliveryStream,
    pending: PendingCallTable,
    shutdown_token: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            () = shutdown_token.cancelled() => break,
            delivery = replies.next() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!("reply stream ended");
                    break;
                }
            },
        };

        complete(&pending, &delivery);
    }

    // Nothing will answer the remaining calls.
    pending.fail_all();
}

fn complete(pending: &PendingCallTable, delivery: &Delivery) {
    let message = delivery.message();
    let Some(correlation_id) = message.properties.correlation_id.as_deref() else {
        warn!("dropping reply without correlation id");
        return;
    };

    let response = match ResponseEnvelope::decode(&message.body) {
        Ok(mut response) => {
            if !message.properties.headers.is_empty() {
                response.headers.clone_from(&message.properties.headers);
            }
            response
        }
        Err(e) => {
            warn!("failed to parse response envelope for {}: {}", correlation_id, e);
            ResponseEnvelope::failure(Status::internal("Failed to parse response envelope"))
        }
    };

    if !pending.complete(correlation_id, response) {
        debug!("received reply for unknown correlation id {}", correlation_id);
    }
}
