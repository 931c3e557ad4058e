//! builder-queue: a pool of container builders behind a TCP dispatcher.

mod builder;
mod status;
mod version;

pub mod backend;
pub mod executor;
pub mod pool;
pub mod retry;
pub mod server;
pub mod transfer;

pub use backend::{BackendError, HttpBackend, HttpBackendConfig, ProvisioningBackend, StaticBackend};
pub use builder::BuilderHandle;
pub use executor::{BuildError, BuildExecutor, CommandExecutor};
pub use pool::{BuilderLease, BuilderPool, ConfigError, PoolConfig, PoolError};
pub use retry::RetryScheduler;
pub use server::{Command, DispatchError, Server, ServerConfig, serve, shutdown_signal};
pub use status::PoolStatus;
pub use transfer::TransferError;
pub use version::{BUILDER_QUEUE_VERSION, user_agent};
