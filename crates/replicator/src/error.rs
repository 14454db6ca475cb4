//! Error taxonomy for the replica manager, per the per-partition/global split in
//! the produce and fetch paths.

use replicator_storage::StorageError;
use std::fmt;

/// Per-partition error returned from an append or fetch on a single `TopicPartition`.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionError {
    UnknownTopicOrPartition,
    NotLeaderForPartition,
    ReplicaNotAvailable,
    StaleLeaderEpoch { current: u64, requested: u64 },
    InvalidTopic { topic: String },
    RecordTooLarge,
    RecordBatchTooLarge,
    CorruptRecord,
    InvalidMessage { reason: String },
    InvalidTimestamp,
    OffsetOutOfRange { requested: u64, log_start: u64, log_end: u64 },
    RequestTimedOut,
    NotEnoughReplicas { have: usize, need: usize },
    NotEnoughReplicasAfterAppend { have: usize, need: usize },
    /// `requiredAcks` outside `{-1, 0, 1}`. Conceptually a request-level
    /// error, but the produce path fills every requested partition's
    /// response slot with it rather than short-circuiting before a response
    /// is built, so it lives here rather than in `RequestError`.
    InvalidRequiredAcks { requested: i16 },
    Unknown { reason: String },
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::UnknownTopicOrPartition => write!(f, "unknown topic or partition"),
            PartitionError::NotLeaderForPartition => write!(f, "not leader for partition"),
            PartitionError::ReplicaNotAvailable => write!(f, "replica not available"),
            PartitionError::StaleLeaderEpoch { current, requested } => write!(
                f,
                "stale leader epoch: current {current}, requested {requested}"
            ),
            PartitionError::InvalidTopic { topic } => {
                write!(f, "invalid topic for this operation: {topic}")
            }
            PartitionError::RecordTooLarge => write!(f, "record too large"),
            PartitionError::RecordBatchTooLarge => write!(f, "record batch too large"),
            PartitionError::CorruptRecord => write!(f, "corrupt record"),
            PartitionError::InvalidMessage { reason } => write!(f, "invalid message: {reason}"),
            PartitionError::InvalidTimestamp => write!(f, "invalid timestamp"),
            PartitionError::OffsetOutOfRange {
                requested,
                log_start,
                log_end,
            } => write!(
                f,
                "offset {requested} out of range [{log_start}, {log_end})"
            ),
            PartitionError::RequestTimedOut => write!(f, "request timed out"),
            PartitionError::NotEnoughReplicas { have, need } => {
                write!(f, "not enough replicas: have {have}, need {need}")
            }
            PartitionError::NotEnoughReplicasAfterAppend { have, need } => write!(
                f,
                "not enough replicas after append: have {have}, need {need}"
            ),
            PartitionError::InvalidRequiredAcks { requested } => {
                write!(f, "invalid required acks: {requested}")
            }
            PartitionError::Unknown { reason } => write!(f, "unknown error: {reason}"),
        }
    }
}

impl std::error::Error for PartitionError {}

impl From<StorageError> for PartitionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DataCorruption { details, .. } => {
                PartitionError::InvalidMessage { reason: details }
            }
            other => PartitionError::Unknown {
                reason: other.to_string(),
            },
        }
    }
}

/// Request-level error that short-circuits the whole call before any per-partition
/// work is attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    StaleControllerEpoch { current: u64, requested: u64 },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::StaleControllerEpoch { current, requested } => write!(
                f,
                "stale controller epoch: current {current}, requested {requested}"
            ),
        }
    }
}

impl std::error::Error for RequestError {}

/// Unrecoverable failure on a local log or the HW checkpoint file. Per the design,
/// a broker that cannot durably record state must halt rather than keep serving
/// with possibly-stale durability guarantees; this type is the signal callers
/// propagate up to whatever drives the process halt.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageFailure {
    pub context: String,
    pub reason: String,
}

impl fmt::Display for StorageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage failure in {}: {}", self.context, self.reason)
    }
}

impl std::error::Error for StorageFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_error_display() {
        let error = PartitionError::OffsetOutOfRange {
            requested: 42,
            log_start: 0,
            log_end: 10,
        };
        assert_eq!(error.to_string(), "offset 42 out of range [0, 10)");
    }

    #[test]
    fn test_storage_error_conversion() {
        let storage_error = StorageError::DataCorruption {
            context: "append".to_string(),
            details: "bad batch".to_string(),
        };
        let partition_error: PartitionError = storage_error.into();
        assert!(matches!(
            partition_error,
            PartitionError::InvalidMessage { .. }
        ));
    }
}
