//! Fixed-delay retry.
//!
//! Every retry waits the same delay. There is no backoff growth, no jitter and
//! no attempt cap: an action handed to [`RetryScheduler::retry`] runs until it
//! succeeds.
//!
//! [`RetryScheduler::schedule`] is the timer half of `retry` on its own: one
//! delayed re-run, for callers whose failure arrives as an event rather than
//! as a returned `Err` (the pool's refill after a failed create). Both wait
//! through [`RetryScheduler::pause`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryScheduler {
    delay: Duration,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

impl RetryScheduler {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait out one retry delay.
    pub async fn pause(&self) {
        tokio::time::sleep(self.delay).await;
    }

    /// Run `action` on its own task once the delay has elapsed.
    ///
    /// The timer lives inside the spawned task and is dropped as soon as it
    /// fires.
    pub fn schedule<F>(&self, action: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = *self;
        tokio::spawn(async move {
            scheduler.pause().await;
            action.await;
        })
    }

    /// Invoke `action` until it returns `Ok`, sleeping the delay after each
    /// failure. Attempts never overlap.
    pub async fn retry<F, Fut, T, E>(&self, mut action: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match action().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Retried action succeeded");
                    }
                    return value;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempt,
                        retry_in_ms = self.delay.as_millis() as u64,
                        "Action failed, retrying"
                    );
                    self.pause().await;
                }
            }
        }
    }
}
