//! Pool status snapshot for diagnostics.

use serde::{Deserialize, Serialize};

use crate::builder::BuilderHandle;

/// Point-in-time view of the pool.
///
/// Only `active` and `reserve` go on the wire; the counters are for in-process
/// callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub active: Vec<BuilderHandle>,
    pub reserve: Vec<BuilderHandle>,
    /// Checkouts waiting for a builder.
    #[serde(skip)]
    pub pending: usize,
    /// Creation requests issued to the backend and not yet resolved.
    #[serde(skip)]
    pub outstanding_creates: usize,
}

impl PoolStatus {
    /// Pretty JSON document with `active` and `reserve` arrays.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
