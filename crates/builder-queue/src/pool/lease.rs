use super::manager::BuilderPool;
use crate::builder::BuilderHandle;

/// A checked-out builder that goes back to the pool when dropped.
///
/// Returned builders are destroyed, so a lease must not outlive the build it
/// was acquired for.
#[derive(Debug)]
pub struct BuilderLease {
    builder: BuilderHandle,
    pool: BuilderPool,
}

impl BuilderLease {
    pub(super) fn new(builder: BuilderHandle, pool: BuilderPool) -> Self {
        Self { builder, pool }
    }

    pub fn builder(&self) -> &BuilderHandle {
        &self.builder
    }
}

impl std::ops::Deref for BuilderLease {
    type Target = BuilderHandle;

    fn deref(&self) -> &BuilderHandle {
        &self.builder
    }
}

impl Drop for BuilderLease {
    fn drop(&mut self) {
        tracing::debug!(builder_id = %self.builder, "Releasing builder lease");
        self.pool.return_builder(self.builder.clone());
    }
}
