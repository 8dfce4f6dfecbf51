use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// A per-call cancellation handle.
///
/// Combines any number of parent tokens (caller, process shutdown) with an
/// optional deadline into a single token. Built once when a call starts and
/// passed down to everything working on the call. Dropping the handle stops
/// the background tasks that link parents and deadline, but does not cancel
/// the token.
#[derive(Debug, Default)]
pub struct CallCancellation {
    deadline: Option<Instant>,
    links: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl CallCancellation {
    /// A handle with no parents and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle cancelled whenever `parent` is.
    #[must_use]
    pub fn linked_to(parent: &CancellationToken) -> Self {
        Self {
            deadline: None,
            links: Vec::new(),
            token: parent.child_token(),
        }
    }

    /// Also cancel when `other` is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_link(mut self, other: &CancellationToken) -> Self {
        if other.is_cancelled() {
            self.token.cancel();
            return self;
        }

        let token = self.token.clone();
        let other = other.clone();
        self.links.push(tokio::spawn(async move {
            tokio::select! {
                () = other.cancelled() => token.cancel(),
                () = token.cancelled() => {}
            }
        }));
        self
    }

    /// Also cancel at `deadline`. The earliest deadline wins.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        if self.deadline.is_some_and(|existing| existing <= deadline) {
            return self;
        }
        self.deadline = Some(deadline);

        let token = self.token.clone();
        self.links.push(tokio::spawn(async move {
            tokio::select! {
                () = sleep_until(deadline) => token.cancel(),
                () = token.cancelled() => {}
            }
        }));
        self
    }

    /// Also cancel after `timeout`.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        self.with_deadline(deadline)
    }

    /// The combined token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Whether the call has been cancelled for any reason.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits until the call is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Drop for CallCancellation {
    fn drop(&mut self) {
        for link in &self.links {
            link.abort();
        }
    }
}

/// An instant far enough away to never fire in practice.
#[must_use]
pub fn far_future() -> Instant {
    // Roughly 30 years.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}
