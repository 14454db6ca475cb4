use crate::storage::memory::InMemoryReplicationLog;
use crate::storage::r#trait::ReplicationLog;
use parking_lot::RwLock;
use std::sync::Arc;

/// Picks which `ReplicationLog` implementation backs a newly created partition.
///
/// The on-disk segmented log engine lives outside this crate; a deployment that
/// wants durable storage plugs its own `ReplicationLog` impl in and never needs
/// this enum. `StorageBackend` only exists to keep the in-memory path (used by
/// tests and by any all-in-memory deployment) swappable the same way.
#[derive(Debug, Clone, Copy, Default)]
pub enum StorageBackend {
    #[default]
    Memory,
}

impl StorageBackend {
    pub fn create(&self) -> Arc<RwLock<dyn ReplicationLog>> {
        match self {
            StorageBackend::Memory => Arc::new(RwLock::new(InMemoryReplicationLog::new())),
        }
    }
}
