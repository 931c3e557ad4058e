//! Builder handle: identity of one provisioned build worker.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A provisioned builder as reported by the provisioning backend.
///
/// Handles are immutable. Equality and hashing use `id` only, so two handles
/// naming the same backend instance compare equal even if the backend reported
/// a different address for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderHandle {
    id: String,
    host: String,
    port: u16,
}

impl BuilderHandle {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for BuilderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BuilderHandle {}

impl Hash for BuilderHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for BuilderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
