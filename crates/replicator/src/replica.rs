//! Per-broker view of one partition.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use replicator_storage::ReplicationLog;
use std::sync::Arc;

use crate::types::BrokerId;

/// One broker's view of a partition: either the local leader/follower replica
/// (has a `log` handle) or a remote replica the leader is tracking for ISR
/// purposes (no `log`, updated only via `update_fetch_state`).
pub struct Replica {
    pub broker_id: BrokerId,
    /// Offset one past the last record appended to this replica's log (LEO).
    log_end_offset: u64,
    /// Wall-clock time this replica last had LEO >= the leader's LEO at fetch time.
    last_caught_up_time: DateTime<Utc>,
    /// Present only for the local replica; absent for remote replicas the leader
    /// tracks purely through fetch-state updates.
    log: Option<Arc<RwLock<dyn ReplicationLog>>>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("broker_id", &self.broker_id)
            .field("log_end_offset", &self.log_end_offset)
            .field("last_caught_up_time", &self.last_caught_up_time)
            .field("is_local", &self.log.is_some())
            .finish()
    }
}

impl Replica {
    /// Construct a remote replica view with a caller-supplied starting LEO and
    /// "caught up at" timestamp, used when materialising ISR members on a
    /// leadership transition.
    pub fn new_remote(broker_id: BrokerId, log_end_offset: u64, now: DateTime<Utc>) -> Self {
        Self {
            broker_id,
            log_end_offset,
            last_caught_up_time: now,
            log: None,
        }
    }

    /// Construct the local replica, backed by an actual log handle.
    pub fn new_local(
        broker_id: BrokerId,
        log: Arc<RwLock<dyn ReplicationLog>>,
        now: DateTime<Utc>,
    ) -> Self {
        let log_end_offset = log.read().log_end_offset();
        Self {
            broker_id,
            log_end_offset,
            last_caught_up_time: now,
            log: Some(log),
        }
    }

    pub fn is_local(&self) -> bool {
        self.log.is_some()
    }

    pub fn log(&self) -> Option<&Arc<RwLock<dyn ReplicationLog>>> {
        self.log.as_ref()
    }

    pub fn log_end_offset(&self) -> u64 {
        self.log_end_offset
    }

    pub fn last_caught_up_time(&self) -> DateTime<Utc> {
        self.last_caught_up_time
    }

    /// Refresh this replica's LEO from its own local log. Only meaningful for
    /// the local replica; remote replicas are updated via `update_fetch_state`.
    pub fn refresh_from_local_log(&mut self) {
        if let Some(log) = &self.log {
            self.log_end_offset = log.read().log_end_offset();
        }
    }

    /// Record a follower's fetch progress. `leo_at_fetch_start` is the leader's
    /// LEO observed before the fetch was served; the follower is considered
    /// caught up at `now` iff its new LEO reaches that snapshot.
    pub fn update_fetch_state(&mut self, new_leo: u64, leo_at_fetch_start: u64, now: DateTime<Utc>) {
        self.log_end_offset = new_leo;
        if new_leo >= leo_at_fetch_start {
            self.last_caught_up_time = now;
        }
    }
}
