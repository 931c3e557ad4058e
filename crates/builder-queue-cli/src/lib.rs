//! Command-line front ends for builder-queue.

pub mod client;
pub mod config;
pub mod logging;
