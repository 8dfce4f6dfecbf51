use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Added to every sleep so a timer waking fractionally early does not
/// reschedule for the last sliver of time.
pub const TIMER_EPSILON: Duration = Duration::from_millis(14);

/// How long the timer sleeps for `remaining` time, given the longest
/// allowed single sleep.
#[must_use]
pub fn timer_due_time(remaining: Duration, max_due: Duration) -> Duration {
    remaining.saturating_add(TIMER_EPSILON).min(max_due)
}

/// Cancels a token once a deadline passes.
///
/// A single sleep never exceeds the configured maximum due time. When it
/// wakes before the deadline the remaining time is recomputed and the timer
/// goes back to sleep. Dropping the timer stops it.
#[derive(Debug)]
pub struct DeadlineTimer {
    task: JoinHandle<()>,
}

impl DeadlineTimer {
    /// Starts the timer. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(deadline: Instant, max_due: Duration, token: CancellationToken) -> Self {
        let task = tokio::spawn(async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!("starting deadline timeout, duration: {:?}", remaining);

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!("deadline exceeded");
                    token.cancel();
                    return;
                }

                tokio::select! {
                    () = token.cancelled() => return,
                    () = sleep(timer_due_time(remaining, max_due)) => {}
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if !remaining.is_zero() {
                    debug!("deadline timer rescheduled, remaining: {:?}", remaining);
                }
            }
        });

        Self { task }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
