use super::r#trait::{PartitionId, ReplicationLog};
use crate::error::StorageError;
use crate::{Record, RecordWithOffset};
use std::collections::VecDeque;

/// In-memory implementation of a single topic-partition's log.
///
/// Backs tests and any deployment that does not need durability across restarts.
/// Records are kept contiguous in a `VecDeque`; `log_start_offset` tracks how far
/// the front has been trimmed by `delete_before` so indices can be recovered
/// without shifting every remaining record.
#[derive(Debug)]
pub struct InMemoryReplicationLog {
    records: VecDeque<RecordWithOffset>,
    log_start_offset: u64,
    log_end_offset: u64,
}

impl InMemoryReplicationLog {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
            log_start_offset: 0,
            log_end_offset: 0,
        }
    }

    fn index_of(&self, offset: u64) -> Option<usize> {
        if offset < self.log_start_offset || offset >= self.log_end_offset {
            return None;
        }
        Some((offset - self.log_start_offset) as usize)
    }
}

impl Default for InMemoryReplicationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationLog for InMemoryReplicationLog {
    fn append(&mut self, record: Record) -> Result<u64, StorageError> {
        let offset = self.log_end_offset;
        self.records.push_back(RecordWithOffset::from_record(record, offset));
        self.log_end_offset += 1;
        Ok(offset)
    }

    fn read(
        &self,
        from_offset: u64,
        max_bytes: Option<usize>,
    ) -> Result<Vec<RecordWithOffset>, StorageError> {
        if from_offset >= self.log_end_offset {
            return Ok(Vec::new());
        }

        let start_index = if from_offset < self.log_start_offset {
            0
        } else {
            (from_offset - self.log_start_offset) as usize
        };

        if start_index >= self.records.len() {
            return Ok(Vec::new());
        }

        let slice: Vec<RecordWithOffset> = self.records.iter().skip(start_index).cloned().collect();
        let limited = match max_bytes {
            Some(limit) => slice.into_iter().take(limit).collect(),
            None => slice,
        };
        Ok(limited)
    }

    fn truncate_to(&mut self, offset: u64) -> Result<(), StorageError> {
        if offset > self.log_end_offset {
            return Err(StorageError::DataCorruption {
                context: "memory replication log truncate".to_string(),
                details: format!(
                    "truncate offset {offset} exceeds log end offset {}",
                    self.log_end_offset
                ),
            });
        }
        if offset < self.log_start_offset {
            self.records.clear();
            self.log_start_offset = offset;
            self.log_end_offset = offset;
            return Ok(());
        }

        let keep = match self.index_of(offset) {
            Some(idx) => idx,
            None => self.records.len(),
        };
        self.records.truncate(keep);
        self.log_end_offset = offset;
        Ok(())
    }

    fn delete_before(&mut self, offset: u64) -> Result<(), StorageError> {
        let offset = offset.min(self.log_end_offset);
        if offset <= self.log_start_offset {
            return Ok(());
        }
        let drop_count = (offset - self.log_start_offset) as usize;
        let drop_count = drop_count.min(self.records.len());
        self.records.drain(..drop_count);
        self.log_start_offset = offset;
        Ok(())
    }

    fn log_end_offset(&self) -> u64 {
        self.log_end_offset
    }

    fn log_start_offset(&self) -> u64 {
        self.log_start_offset
    }
}

/// Keyed collection of per-partition in-memory logs, for code that manages
/// several partitions of a topic under one handle.
#[derive(Debug, Default)]
pub struct InMemoryReplicationLogSet {
    partitions: std::collections::HashMap<PartitionId, InMemoryReplicationLog>,
}

impl InMemoryReplicationLogSet {
    pub fn new() -> Self {
        Self {
            partitions: std::collections::HashMap::new(),
        }
    }

    pub fn partition_mut(&mut self, partition_id: PartitionId) -> &mut InMemoryReplicationLog {
        self.partitions
            .entry(partition_id)
            .or_insert_with(InMemoryReplicationLog::new)
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<&InMemoryReplicationLog> {
        self.partitions.get(&partition_id)
    }
}
