//! Periodic keepalive scheduling.
//!
//! The service drops sessions that go quiet. When a keepalive interval is
//! configured the client runs one [`Keepalive`] task per active session; it
//! is cancelled the moment the session leaves Active.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Handle to a running keepalive task.
pub struct Keepalive {
    cancel: CancellationToken,
}

impl Keepalive {
    /// Run `tick` every `period`, first after one full period.
    ///
    /// The loop ends when cancelled or when `tick` returns an error.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent: u64 = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            tracing::debug!(error = %e, "Keepalive stopped");
                            break;
                        }
                        sent += 1;
                        tracing::trace!(sent, "Keepalive sent");
                    }
                }
            }
            tracing::debug!(sent, "Keepalive task terminated");
        });

        Self { cancel }
    }

    /// Stop the task. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
