//! Identifiers for STRAND entities.
//!
//! Processes carry a UUID so they can be correlated across logs.
//! Everything a process owns (threads, flows, units, containers) lives in
//! per-process arena tables and is addressed by a small typed key.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process identifier - identifies one top-level unit of isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Create a new random ProcessId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc_{}", self.0)
    }
}

macro_rules! arena_key {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Create from a raw slot index
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw slot index
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

arena_key!(
    /// Key of a Thread Context within its process
    ThreadKey,
    "thread"
);
arena_key!(
    /// Key of a Flow within its process
    FlowKey,
    "flow"
);
arena_key!(
    /// Key of an Execution Unit within its process
    UnitKey,
    "unit"
);
arena_key!(
    /// Key of a Resource Container within its process
    ContainerKey,
    "container"
);

/// Monotonic allocator for arena keys
///
/// One allocator is shared by every table of a process so a raw value is
/// never reused for two different entities.
#[derive(Debug, Clone, Default)]
pub struct KeyAllocator {
    next: u64,
}

impl KeyAllocator {
    /// Create a new allocator starting at zero
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    fn bump(&mut self) -> u64 {
        let raw = self.next;
        self.next += 1;
        raw
    }

    /// Allocate a thread key
    pub fn thread(&mut self) -> ThreadKey {
        ThreadKey(self.bump())
    }

    /// Allocate a flow key
    pub fn flow(&mut self) -> FlowKey {
        FlowKey(self.bump())
    }

    /// Allocate a unit key
    pub fn unit(&mut self) -> UnitKey {
        UnitKey(self.bump())
    }

    /// Allocate a container key
    pub fn container(&mut self) -> ContainerKey {
        ContainerKey(self.bump())
    }
}
