//! Self-rescheduling background loop.
//!
//! A [`RepeatingTask`] sleeps for its period, runs one tick to completion,
//! then sleeps again. The next sleep only starts once the tick resolves, so
//! a slow store stretches the effective period instead of stacking
//! concurrent ticks. Cancellation is only observed while sleeping: a tick
//! that has started always runs to the end.

use std::{future::Future, time::Duration};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a spawned repeating loop. Dropping it cancels the loop.
#[derive(Debug)]
pub(crate) struct RepeatingTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawns a loop that calls `tick` every `period`, first after one
    /// period has elapsed.
    pub(crate) fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            debug!(task = name, period_ms = period.as_millis() as u64, "loop started");

            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {},
                    () = cancelled.cancelled() => break,
                }

                tick().await;
            }

            debug!(task = name, "loop stopped");
        });

        Self { name, token, handle }
    }

    /// Stops future ticks without waiting for an in-flight one.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the loop and waits for an in-flight tick to finish.
    pub(crate) async fn stop(mut self) -> Result<(), JoinError> {
        self.token.cancel();
        (&mut self.handle).await
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
