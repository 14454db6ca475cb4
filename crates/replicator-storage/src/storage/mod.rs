pub mod backend;
pub mod memory;
pub mod r#trait;

pub use backend::StorageBackend;
pub use memory::{InMemoryReplicationLog, InMemoryReplicationLogSet};
pub use r#trait::{PartitionId, ReplicationLog};
