//! Identity and shared value types for the replica manager.

use replicator_cluster::types::PartitionId;
use std::fmt;

pub use replicator_cluster::types::{BrokerId, Epoch};

/// Identity key for a hosted log: a topic name paired with a partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// `requiredAcks` accepted by `ReplicaManager::append_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// Acknowledge without waiting for any replica to append.
    None,
    /// Acknowledge once the leader has appended locally.
    Leader,
    /// Acknowledge once every in-sync replica has appended (acks = -1).
    All,
}

impl RequiredAcks {
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(RequiredAcks::None),
            1 => Some(RequiredAcks::Leader),
            -1 => Some(RequiredAcks::All),
            _ => None,
        }
    }
}

/// Identifies the caller of `ReplicaManager::fetch_messages`.
///
/// A non-negative id means a follower broker replicating this partition; `Consumer`
/// means an ordinary client capped at the high watermark; `Debug` disables the
/// leader-only check entirely and is never accepted outside test harnesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherId {
    Consumer,
    Follower(BrokerId),
    Debug,
}

impl FetcherId {
    pub fn is_follower(&self) -> bool {
        matches!(self, FetcherId::Follower(_))
    }

    pub fn caps_at_high_watermark(&self) -> bool {
        matches!(self, FetcherId::Consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("orders", PartitionId::new(3));
        assert_eq!(tp.to_string(), "orders-3");
    }

    #[test]
    fn test_required_acks_from_i16() {
        assert_eq!(RequiredAcks::from_i16(-1), Some(RequiredAcks::All));
        assert_eq!(RequiredAcks::from_i16(0), Some(RequiredAcks::None));
        assert_eq!(RequiredAcks::from_i16(1), Some(RequiredAcks::Leader));
        assert_eq!(RequiredAcks::from_i16(2), None);
    }

    #[test]
    fn test_fetcher_id_classification() {
        assert!(FetcherId::Follower(BrokerId(2)).is_follower());
        assert!(!FetcherId::Consumer.is_follower());
        assert!(FetcherId::Consumer.caps_at_high_watermark());
        assert!(!FetcherId::Follower(BrokerId(2)).caps_at_high_watermark());
        assert!(!FetcherId::Debug.caps_at_high_watermark());
    }
}
