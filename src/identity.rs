//! Instance identities: process-unique tokens keying each mounted
//! artifact's container and style scope.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Attribute placed on every instance container.
pub const SCOPE_ATTRIBUTE: &str = "data-preview-id";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Mint a fresh identity. Values are never reused within a process.
    pub fn mint() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Attribute selector matching this instance's container.
    pub fn selector(&self) -> String {
        format!("[{}=\"{}\"]", SCOPE_ATTRIBUTE, self)
    }

    /// Attribute as written on the container element.
    pub fn attribute(&self) -> String {
        format!("{}=\"{}\"", SCOPE_ATTRIBUTE, self)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p-{}", self.0)
    }
}
