//! Version information for builder-queue.

/// builder-queue version from Cargo.toml
pub const BUILDER_QUEUE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent to the provisioning backend.
pub fn user_agent() -> String {
    format!("builder-queue/{}", BUILDER_QUEUE_VERSION)
}
