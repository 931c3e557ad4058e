//! Builder pool manager.
//!
//! Flow:
//! 1. `BuilderPool::start` spawns the manager task and runs an initial refill
//! 2. Checkouts, returns, backend completions and retry timers arrive as messages
//! 3. Each message is applied to [`PoolState`]; the resulting effects spawn
//!    backend calls that report back as further messages
//!
//! Only the manager task touches pool state, so no step ever interleaves with
//! another.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use super::config::{ConfigError, PoolConfig};
use super::lease::BuilderLease;
use super::state::{PendingCheckout, PoolEffect, PoolState};
use crate::backend::{BackendError, ProvisioningBackend};
use crate::builder::BuilderHandle;
use crate::retry::RetryScheduler;
use crate::status::PoolStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("builder pool is shut down")]
    Closed,
}

enum PoolMessage {
    Checkout(oneshot::Sender<BuilderHandle>),
    Return(BuilderHandle),
    Created(Result<BuilderHandle, BackendError>),
    Destroyed(BuilderHandle),
    Refill,
    Status(oneshot::Sender<PoolStatus>),
}

/// Handle to the pool manager task. Cheap to clone.
#[derive(Clone)]
pub struct BuilderPool {
    tx: mpsc::UnboundedSender<PoolMessage>,
    // Cancelled when the manager task ends for any reason, panics included.
    stopped: CancellationToken,
}

impl std::fmt::Debug for BuilderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderPool")
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

impl BuilderPool {
    /// Validate `config` and spawn the manager task on the current runtime.
    ///
    /// The pool starts empty and immediately begins filling its reserve.
    pub fn start(
        config: PoolConfig,
        backend: Arc<dyn ProvisioningBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stopped = CancellationToken::new();
        let manager = PoolManager {
            state: PoolState::new(&config),
            backend,
            retry: RetryScheduler::new(config.retry_delay),
            tx: tx.downgrade(),
            rx,
            _stopped: stopped.clone().drop_guard(),
        };

        tracing::info!(
            max_builders = config.max_builders,
            max_reserve_builders = config.max_reserve_builders,
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            "Starting builder pool"
        );
        tokio::spawn(manager.run());

        Ok(Self { tx, stopped })
    }

    /// Resolves once the manager task has ended.
    ///
    /// The manager only ends early on a logic error, after which every
    /// operation fails with [`PoolError::Closed`]. Servers should stop when
    /// this resolves.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Queue a checkout. `reply` receives exactly one builder once one is
    /// available; there is no timeout.
    ///
    /// Dropping the receiving end before a builder arrives cancels the
    /// checkout. If the pool has shut down, `reply` is dropped.
    pub fn checkout(&self, reply: oneshot::Sender<BuilderHandle>) {
        if self.tx.send(PoolMessage::Checkout(reply)).is_err() {
            tracing::warn!("Checkout requested after pool shutdown");
        }
    }

    /// Wait in the checkout queue for a builder.
    ///
    /// The caller owns the builder and must hand it back with
    /// [`return_builder`](Self::return_builder). Prefer [`lease`](Self::lease).
    ///
    /// Dropping the future withdraws the checkout. A builder that was already
    /// handed over but not yet received is returned to the pool.
    pub async fn acquire(&self) -> Result<BuilderHandle, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.checkout(tx);
        let mut waiting = WaitingCheckout {
            pool: self,
            rx,
            received: false,
        };
        let builder = (&mut waiting.rx).await.map_err(|_| PoolError::Closed)?;
        waiting.received = true;
        Ok(builder)
    }

    /// Wait for a builder wrapped in a guard that returns it on drop.
    pub async fn lease(&self) -> Result<BuilderLease, PoolError> {
        let builder = self.acquire().await?;
        Ok(BuilderLease::new(builder, self.clone()))
    }

    /// Relinquish a checked-out builder. It is destroyed, never reused.
    ///
    /// The manager panics if `builder` is not currently checked out.
    pub fn return_builder(&self, builder: BuilderHandle) {
        if let Err(mpsc::error::SendError(PoolMessage::Return(builder))) =
            self.tx.send(PoolMessage::Return(builder))
        {
            tracing::error!(builder_id = %builder, "Builder returned after pool shutdown, it will not be destroyed");
        }
    }

    /// Snapshot of the active and reserve builders.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Status(tx))
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

/// Receiving side of an `acquire` in progress.
struct WaitingCheckout<'a> {
    pool: &'a BuilderPool,
    rx: oneshot::Receiver<BuilderHandle>,
    received: bool,
}

impl Drop for WaitingCheckout<'_> {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        self.rx.close();
        if let Ok(builder) = self.rx.try_recv() {
            tracing::debug!(builder_id = %builder, "Checkout withdrawn after handoff, returning builder");
            self.pool.return_builder(builder);
        }
    }
}

struct PoolManager {
    state: PoolState,
    backend: Arc<dyn ProvisioningBackend>,
    retry: RetryScheduler,
    // Weak so the manager exits once every BuilderPool handle and in-flight
    // backend call is gone.
    tx: mpsc::WeakUnboundedSender<PoolMessage>,
    rx: mpsc::UnboundedReceiver<PoolMessage>,
    _stopped: DropGuard,
}

impl PoolManager {
    async fn run(mut self) {
        let effects = self.state.refill();
        self.apply(effects);

        while let Some(message) = self.rx.recv().await {
            let effects = match message {
                PoolMessage::Checkout(reply) => {
                    tracing::debug!(pending = self.state.pending_len() + 1, "Checkout queued");
                    self.state.checkout(PendingCheckout::new(reply))
                }
                PoolMessage::Return(builder) => vec![self.state.return_builder(builder)],
                PoolMessage::Created(Ok(builder)) => {
                    tracing::info!(builder_id = %builder, address = %builder.address(), "Created builder");
                    self.state.create_succeeded(builder)
                }
                PoolMessage::Created(Err(e)) => {
                    tracing::error!(
                        error = %e,
                        retry_in_ms = self.retry.delay().as_millis() as u64,
                        "Error creating builder, retrying refill"
                    );
                    self.state.create_failed()
                }
                PoolMessage::Destroyed(builder) => {
                    tracing::info!(builder_id = %builder, "Destroyed builder");
                    self.state.destroy_succeeded()
                }
                PoolMessage::Refill => self.state.refill(),
                PoolMessage::Status(reply) => {
                    let _ = reply.send(self.state.status());
                    Vec::new()
                }
            };
            self.apply(effects);
        }

        tracing::info!("Builder pool manager exiting");
    }

    fn apply(&self, effects: Vec<PoolEffect>) {
        for effect in effects {
            let Some(tx) = self.tx.upgrade() else {
                tracing::warn!(?effect, "Pool shut down, dropping effect");
                continue;
            };
            match effect {
                PoolEffect::Create => {
                    let backend = Arc::clone(&self.backend);
                    tokio::spawn(async move {
                        let result = backend.create_builder().await;
                        let _ = tx.send(PoolMessage::Created(result));
                    });
                }
                PoolEffect::Destroy(builder) => {
                    let backend = Arc::clone(&self.backend);
                    let retry = self.retry;
                    let span = tracing::info_span!("destroy", builder_id = %builder);
                    tokio::spawn(
                        async move {
                            tracing::info!("Attempting to destroy builder");
                            retry.retry(|| backend.destroy_builder(&builder)).await;
                            let _ = tx.send(PoolMessage::Destroyed(builder));
                        }
                        .instrument(span),
                    );
                }
                PoolEffect::ScheduleRefill => {
                    self.retry.schedule(async move {
                        let _ = tx.send(PoolMessage::Refill);
                    });
                }
            }
        }
    }
}
