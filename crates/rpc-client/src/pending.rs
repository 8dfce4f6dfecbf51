use std::sync::Arc;

use dashmap::DashMap;
use mqrpc_core::ResponseEnvelope;
use tokio::sync::oneshot;

/// In-flight calls keyed by correlation id.
///
/// Every removal path (reply, deadline, cancellation, shutdown) goes through
/// an atomic remove, so exactly one of them settles a call.
#[derive(Clone, Debug, Default)]
pub struct PendingCallTable {
    calls: Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl PendingCallTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns the receiver its reply arrives on.
    pub fn insert(&self, correlation_id: impl Into<String>) -> oneshot::Receiver<ResponseEnvelope> {
        let (sender, receiver) = oneshot::channel();
        self.calls.insert(correlation_id.into(), sender);
        receiver
    }

    /// Removes a call without completing it. Returns whether it was present.
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Removes a call and hands it its reply. Returns whether it was present.
    pub fn complete(&self, correlation_id: &str, response: ResponseEnvelope) -> bool {
        match self.calls.remove(correlation_id) {
            Some((_, sender)) => {
                // The receiving side may have been dropped along with its call.
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Drops every pending call. Their receivers observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Number of calls in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use mqrpc_core::Status;

    #[tokio::test]
    async fn test_complete_delivers_reply() {
        let table = PendingCallTable::new();
        let receiver = table.insert("a");

        assert!(table.complete("a", ResponseEnvelope::success("hi")));
        assert_eq!(receiver.await.unwrap().body.as_deref(), Some(&b"hi"[..]));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let table = PendingCallTable::new();
        let _receiver = table.insert("a");

        assert!(!table.complete("b", ResponseEnvelope::success("hi")));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_does_not_cross_calls() {
        let table = PendingCallTable::new();
        let first = table.insert("a");
        let mut second = table.insert("b");

        table.complete("a", ResponseEnvelope::success("for a"));

        assert_eq!(first.await.unwrap().body.as_deref(), Some(&b"for a"[..]));
        assert!(second.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_after_complete_observes_no_entry() {
        let table = PendingCallTable::new();
        let _receiver = table.insert("a");

        assert!(table.complete("a", ResponseEnvelope::failure(Status::cancelled(""))));
        assert!(!table.remove("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_removal_settles_once() {
        for round in 0..200 {
            let table = PendingCallTable::new();
            let id = format!("call-{round}");
            let _receiver = table.insert(id.clone());
            let winners = Arc::new(AtomicUsize::new(0));

            let reply = {
                let (table, id, winners) = (table.clone(), id.clone(), Arc::clone(&winners));
                tokio::spawn(async move {
                    if table.complete(&id, ResponseEnvelope::success("late")) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };
            let deadline = {
                let (table, winners) = (table.clone(), Arc::clone(&winners));
                tokio::spawn(async move {
                    if table.remove(&id) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };
            reply.await.unwrap();
            deadline.await.unwrap();

            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_fail_all_closes_receivers() {
        let table = PendingCallTable::new();
        let first = table.insert("a");
        let second = table.insert("b");

        assert_eq!(table.fail_all(), 2);
        assert!(first.await.is_err());
        assert!(second.await.is_err());
        assert!(table.is_empty());
    }
}
