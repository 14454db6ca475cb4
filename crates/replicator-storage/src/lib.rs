//! Narrow log-storage abstraction consumed by the replica manager.
//!
//! The on-disk segmented log engine (append/read/truncate primitives) is an
//! external collaborator in this design: the replica manager only ever drives a
//! partition's log through the [`ReplicationLog`] trait. This crate supplies the
//! trait plus an in-memory implementation for tests and all-in-memory
//! deployments; a durable backend is expected to implement the same trait.

pub mod error;
pub mod storage;

pub use error::{StorageError, StorageErrorSource};
pub use storage::{PartitionId, ReplicationLog, StorageBackend};

pub mod memory {
    pub use crate::storage::memory::*;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub key: Option<String>,
    pub value: String,
    pub headers: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecordWithOffset {
    #[serde(flatten)]
    pub record: Record,
    pub offset: u64,
    pub timestamp: String,
}

impl Record {
    pub fn new(
        key: Option<String>,
        value: String,
        headers: Option<std::collections::HashMap<String, String>>,
    ) -> Self {
        Self {
            key,
            value,
            headers,
        }
    }

    /// Wire-size estimate in bytes: key + value + header key/value lengths.
    /// Used by the fetch path to honor `minBytes`/`maxBytes` against actual
    /// payload size rather than record count.
    pub fn estimated_size(&self) -> usize {
        let key_len = self.key.as_ref().map_or(0, |k| k.len());
        let header_len: usize = self
            .headers
            .as_ref()
            .map(|h| h.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0);
        key_len + self.value.len() + header_len
    }
}

impl RecordWithOffset {
    pub fn from_record(record: Record, offset: u64) -> Self {
        let timestamp = chrono::Utc::now().to_rfc3339();
        Self {
            record,
            offset,
            timestamp,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.record.estimated_size()
    }
}
