//! Backend that hands out builders without provisioning anything.

use async_trait::async_trait;

use super::{BackendError, ProvisioningBackend};
use crate::builder::BuilderHandle;

/// Every builder points at the same `host:port`; ids are fresh UUIDs.
///
/// Intended for running the queue against a single long-lived build host.
#[derive(Debug, Clone)]
pub struct StaticBackend {
    host: String,
    port: u16,
}

impl StaticBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl ProvisioningBackend for StaticBackend {
    async fn create_builder(&self) -> Result<BuilderHandle, BackendError> {
        let id = format!("static-{}", uuid::Uuid::new_v4());
        tracing::debug!(builder_id = %id, host = %self.host, port = self.port, "Issuing static builder");
        Ok(BuilderHandle::new(id, self.host.clone(), self.port))
    }

    async fn destroy_builder(&self, builder: &BuilderHandle) -> Result<(), BackendError> {
        tracing::debug!(builder_id = %builder, "Releasing static builder");
        Ok(())
    }
}
