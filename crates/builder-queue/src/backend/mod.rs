//! Provisioning backend: where builders come from and where they go.
//!
//! The pool treats every backend error as transient and retries; it never
//! inspects the error beyond logging it.

mod fixed;
mod http;

use async_trait::async_trait;

use crate::builder::BuilderHandle;

pub use fixed::StaticBackend;
pub use http::{HttpBackend, HttpBackendConfig};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Other(String),
}

/// Creates and destroys builders on behalf of the pool.
///
/// Each call is independent; implementations hold no pool state.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Provision a new builder and return its handle once it is reachable.
    async fn create_builder(&self) -> Result<BuilderHandle, BackendError>;

    /// Tear down a builder previously returned by `create_builder`.
    async fn destroy_builder(&self, builder: &BuilderHandle) -> Result<(), BackendError>;
}
