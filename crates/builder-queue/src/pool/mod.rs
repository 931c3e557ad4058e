//! Builder pool: a bounded reserve of ready builders handed out FIFO.
//!
//! [`PoolState`] holds the bookkeeping and decides which backend calls to
//! make. [`BuilderPool`] runs it on a single task and performs those calls.

mod config;
mod lease;
mod manager;
mod state;

pub use config::{ConfigError, PoolConfig};
pub use lease::BuilderLease;
pub use manager::{BuilderPool, PoolError};
pub use state::{PendingCheckout, PoolEffect, PoolState};
