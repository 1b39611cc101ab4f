//! Periodic status poller.
//!
//! Runs one poll per interval on a background task. The first poll happens
//! one interval after `begin`, never immediately. A tick that comes due while
//! the previous poll is still running is skipped, so at most one poll is ever
//! in flight. Cancelling drops any in-flight poll, so its result is never
//! delivered.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct StatusPoller {
    interval: Duration,
}

impl StatusPoller {
    pub fn new(interval: Duration) -> Self {
        // A zero period would spin.
        let interval = interval.max(Duration::from_millis(1));
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the polling loop. `poll` is invoked once per tick and is
    /// responsible for delivering its own result.
    pub fn begin<F, Fut>(&self, mut poll: F) -> PollerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut deadline = Instant::now() + period;
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = sleep_until(deadline) => {}
                }

                ticks += 1;
                trace!(tick = ticks, "Status poll tick");

                tokio::select! {
                    _ = cancelled.cancelled() => {
                        debug!(tick = ticks, "Poller cancelled with a poll in flight");
                        break;
                    }
                    _ = poll() => {}
                }

                // Ticks that came due during the poll are dropped, not queued.
                let now = Instant::now();
                deadline += period;
                let mut skipped: u32 = 0;
                while deadline <= now {
                    deadline += period;
                    skipped += 1;
                }
                if skipped > 0 {
                    debug!(tick = ticks, skipped, "Slow status poll, skipped ticks");
                }
            }
            debug!(ticks, "Status poller stopped");
        });

        PollerHandle { token, task }
    }
}

/// Owns a running poller. Dropping the handle cancels it.
#[derive(Debug)]
pub struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling. Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
