//! Transient node identities.

use dashmap::DashSet;
use std::fmt;
use uuid::Uuid;

/// Hands out node names for subscriptions that were not given one.
pub trait NodeIdAllocator: Send + Sync + fmt::Debug {
    /// Allocates a unique node name.
    fn allocate(&self) -> String;

    /// Returns a previously allocated name.
    fn release(&self, node_name: &str);
}

/// Allocator producing `kvstream-subscriber-<uuid>` names.
#[derive(Debug, Default)]
pub struct UuidNodeIdAllocator {
    in_use: DashSet<String>,
}

impl UuidNodeIdAllocator {
    /// Creates an allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names currently allocated.
    pub fn allocated(&self) -> usize {
        self.in_use.len()
    }
}

impl NodeIdAllocator for UuidNodeIdAllocator {
    fn allocate(&self) -> String {
        let name = format!("kvstream-subscriber-{}", Uuid::new_v4());
        self.in_use.insert(name.clone());
        name
    }

    fn release(&self, node_name: &str) {
        self.in_use.remove(node_name);
    }
}
