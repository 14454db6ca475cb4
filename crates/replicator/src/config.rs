//! Tunables for the replica manager.
//!
//! Loading these values from a config file or environment is an external
//! concern; this struct is just the typed shape the replica manager accepts
//! once that loading has happened.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReplicaManagerConfig {
    /// This broker's id, used to decide leader-vs-follower for each partition.
    pub broker_id: crate::types::BrokerId,

    /// Minimum in-sync replica count required for an acks=all produce to succeed.
    pub min_in_sync_replicas: usize,

    /// A follower not caught up within this long is dropped from ISR.
    pub replica_lag_time_max: Duration,

    /// Cadence of the ISR-expiration background task.
    pub isr_expiration_interval: Duration,

    /// Cadence of the ISR-change-propagation background task.
    pub isr_propagation_interval: Duration,
    /// ISR propagation is suppressed until this long has passed without a new change.
    pub isr_propagation_blackout: Duration,
    /// ISR propagation is forced at least this often regardless of blackout.
    pub isr_propagation_forced_interval: Duration,

    /// Cadence of the high-watermark checkpoint background task.
    pub high_watermark_checkpoint_interval: Duration,

    /// Data directory each partition's checkpoint file is written under.
    pub data_dir: PathBuf,
}

impl ReplicaManagerConfig {
    pub fn new(broker_id: crate::types::BrokerId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            broker_id,
            data_dir: data_dir.into(),
            ..Self::defaults_with_broker(broker_id)
        }
    }

    fn defaults_with_broker(broker_id: crate::types::BrokerId) -> Self {
        Self {
            broker_id,
            min_in_sync_replicas: 1,
            replica_lag_time_max: Duration::from_secs(30),
            isr_expiration_interval: Duration::from_secs(30),
            isr_propagation_interval: Duration::from_millis(2_500),
            isr_propagation_blackout: Duration::from_secs(5),
            isr_propagation_forced_interval: Duration::from_secs(60),
            high_watermark_checkpoint_interval: Duration::from_secs(5),
            data_dir: PathBuf::from("./data"),
        }
    }
}
