use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use mqrpc_broker::{AckError, Acker, Message, QueueOptions};
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A message sitting in a queue.
#[derive(Debug)]
pub struct Queued {
    pub expires_at: Option<Instant>,
    pub message: Message,
    pub redelivered: bool,
}

impl Queued {
    pub fn new(message: Message) -> Self {
        let expires_at = message
            .properties
            .expiration_duration()
            .map(|ttl| Instant::now() + ttl);

        Self {
            expires_at,
            message,
            redelivered: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    pub closed: CancellationToken,
    pub consumers: AtomicUsize,
    pub name: String,
    pub options: QueueOptions,
    pub rx: flume::Receiver<Queued>,
    pub tx: flume::Sender<Queued>,
}

impl MemoryQueue {
    pub fn new(name: String, options: QueueOptions) -> Self {
        let (tx, rx) = flume::unbounded();

        Self {
            closed: CancellationToken::new(),
            consumers: AtomicUsize::new(0),
            name,
            options,
            rx,
            tx,
        }
    }

    pub fn enqueue(&self, queued: Queued) {
        if self.closed.is_cancelled() {
            debug!("queue {} closed, dropping message", self.name);
            return;
        }

        // Both ends live in `self`, so this can only fail once the queue is dropped.
        let _ = self.tx.send(queued);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Decrements the consumer count when a delivery stream is dropped and
/// removes auto-delete queues once nobody is left.
#[derive(Debug)]
pub struct ConsumerGuard {
    pub queue: Arc<MemoryQueue>,
    pub queues: Weak<DashMap<String, Arc<MemoryQueue>>>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let previous = self.queue.consumers.fetch_sub(1, Ordering::SeqCst);

        if previous == 1 && self.queue.options.auto_delete {
            if let Some(queues) = self.queues.upgrade() {
                queues.remove_if(&self.queue.name, |_, q| Arc::ptr_eq(q, &self.queue));
            }
            self.queue.closed.cancel();
            debug!("auto-deleted queue {}", self.queue.name);
        }
    }
}

/// Settles a delivery from a [`MemoryQueue`].
///
/// Holds the message until it is acked so that a rejected or dropped
/// delivery can be put back.
#[derive(Debug)]
pub struct MemoryAcker {
    pub auto_ack: bool,
    pub delivery_tag: u64,
    pub pending: Mutex<Option<(Queued, Option<OwnedSemaphorePermit>)>>,
    pub queue: Arc<MemoryQueue>,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Queued, AckError> {
        self.pending
            .lock()
            .take()
            .map(|(queued, _permit)| queued)
            .ok_or(AckError::AlreadySettled(self.delivery_tag))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AckError> {
        if self.auto_ack {
            return Ok(());
        }

        self.settle().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AckError> {
        if self.auto_ack {
            return Ok(());
        }

        let mut queued = self.settle()?;
        if requeue {
            queued.redelivered = true;
            self.queue.enqueue(queued);
        }

        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some((mut queued, _permit)) = self.pending.get_mut().take() {
            debug!(
                "delivery {} on {} dropped unsettled, requeueing",
                self.delivery_tag, self.queue.name
            );
            queued.redelivered = true;
            self.queue.enqueue(queued);
        }
    }
}
