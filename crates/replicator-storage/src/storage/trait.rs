use crate::error::StorageError;
use crate::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PartitionId> for u32 {
    fn from(partition_id: PartitionId) -> u32 {
        partition_id.0
    }
}

/// Narrow interface the replica manager uses to drive a partition's local log.
///
/// This models the on-disk segmented log engine as an external collaborator: the
/// replica manager only ever sees `append`/`read`/`truncate_to`/`delete`, never
/// segment or index internals, so the storage engine underneath stays swappable.
pub trait ReplicationLog: Send + Sync {
    /// Append a single record at the end of the log, returning its assigned offset.
    fn append(&mut self, record: Record) -> Result<u64, StorageError>;

    /// Append a batch of records atomically, returning the offset of the last record.
    /// An empty batch is a no-op that returns `log_end_offset() - 1` (or 0 if empty).
    fn append_batch(&mut self, records: Vec<Record>) -> Result<u64, StorageError> {
        let mut last = self.log_end_offset().saturating_sub(1);
        for record in records {
            last = self.append(record)?;
        }
        Ok(last)
    }

    /// Read up to `max_bytes` worth of records starting at `from_offset`.
    /// Returns an empty vec if `from_offset` is at or beyond the log end.
    fn read(
        &self,
        from_offset: u64,
        max_bytes: Option<usize>,
    ) -> Result<Vec<crate::RecordWithOffset>, StorageError>;

    /// Discard every record at or after `offset`, resetting the log end offset to `offset`.
    /// Used on a become-follower transition: the replica manager never retains an
    /// uncommitted suffix across a leadership change.
    fn truncate_to(&mut self, offset: u64) -> Result<(), StorageError>;

    /// Discard every record strictly before `offset`, advancing the log start offset.
    fn delete_before(&mut self, offset: u64) -> Result<(), StorageError>;

    /// Wipe the log entirely, resetting both the start and end offset to zero.
    /// Used by `stopReplica(delete=true)`; the default implementation reuses
    /// `truncate_to`, which already resets both offsets when truncating to a
    /// point before the current log start.
    fn delete(&mut self) -> Result<(), StorageError> {
        self.truncate_to(0)
    }

    /// Offset one past the last record in the log (LEO).
    fn log_end_offset(&self) -> u64;

    /// Offset of the oldest retained record in the log.
    fn log_start_offset(&self) -> u64;

    fn len(&self) -> usize {
        (self.log_end_offset() - self.log_start_offset()) as usize
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
