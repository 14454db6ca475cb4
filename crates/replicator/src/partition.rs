//! Models one topic-partition: its replicas, ISR membership, leader epoch, and
//! high-watermark computation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use replicator_storage::{Record, RecordWithOffset, ReplicationLog, StorageBackend};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::PartitionError;
use crate::replica::Replica;
use crate::types::{BrokerId, Epoch, RequiredAcks, TopicPartition};

/// Which role this partition currently plays on this broker.
///
/// A `Partition` holds no reference back to the `ReplicaManager` that owns it —
/// the cyclic Partition<->ReplicaManager dependency in the original design is
/// resolved by having callers (the replica manager) snapshot what they need,
/// call into the partition, and handle manager-level side effects (purgatory
/// wakeups, fetcher registration) themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    Offline,
    Leader,
    Follower,
}

/// Outcome of a successful `append_to_leader` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendInfo {
    pub first_offset: u64,
    pub last_offset: u64,
    pub high_watermark_advanced: bool,
}

/// Outcome of `update_follower_fetch_state`, telling the replica manager
/// which external side effects to perform (ISR persistence, produce-purgatory
/// wakeups) without `Partition` holding a callback reference of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FollowerUpdateOutcome {
    pub high_watermark_advanced: bool,
    pub isr_expanded: bool,
}

/// Outcome of a successful `read_from_local` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchInfo {
    pub records: Vec<RecordWithOffset>,
    /// The leader's LEO as observed right before the read, used by the caller to
    /// decide whether the reply represents "read to end of log".
    pub leader_log_end_offset_before_read: u64,
    pub high_watermark: u64,
}

struct PartitionState {
    mode: PartitionMode,
    leader_epoch: Epoch,
    controller_epoch: u64,
    /// Leader broker id when in `Follower` mode; `None` when `Leader` (the local
    /// broker is its own leader) or `Offline`.
    leader_id: Option<BrokerId>,
    assigned_replicas: Vec<BrokerId>,
    isr: HashSet<BrokerId>,
    high_watermark: u64,
    local_replica: Option<Replica>,
    remote_replicas: std::collections::HashMap<BrokerId, Replica>,
}

/// One topic-partition hosted (or formerly hosted) by this broker.
///
/// Fields that change on the hot path (ISR, HW, leader state) live behind a
/// single fine-grained `Mutex` so `append`/`read` can snapshot what they need,
/// perform log I/O without holding the lock, then re-acquire briefly to publish
/// results — per the no-lock-across-log-IO discipline.
pub struct Partition {
    pub topic_partition: TopicPartition,
    local_broker_id: BrokerId,
    min_in_sync_replicas: usize,
    backend: StorageBackend,
    state: Mutex<PartitionState>,
}

impl Partition {
    pub fn new(
        topic_partition: TopicPartition,
        local_broker_id: BrokerId,
        min_in_sync_replicas: usize,
        backend: StorageBackend,
    ) -> Self {
        Self {
            topic_partition,
            local_broker_id,
            min_in_sync_replicas,
            backend,
            state: Mutex::new(PartitionState {
                mode: PartitionMode::Offline,
                leader_epoch: Epoch(0),
                controller_epoch: 0,
                leader_id: None,
                assigned_replicas: Vec::new(),
                isr: HashSet::new(),
                high_watermark: 0,
                local_replica: None,
                remote_replicas: std::collections::HashMap::new(),
            }),
        }
    }

    pub fn mode(&self) -> PartitionMode {
        self.state.lock().mode
    }

    pub fn leader_epoch(&self) -> Epoch {
        self.state.lock().leader_epoch
    }

    pub fn high_watermark(&self) -> u64 {
        self.state.lock().high_watermark
    }

    pub fn in_sync_replicas(&self) -> HashSet<BrokerId> {
        self.state.lock().isr.clone()
    }

    pub fn assigned_replicas(&self) -> Vec<BrokerId> {
        self.state.lock().assigned_replicas.clone()
    }

    pub fn log_end_offset(&self) -> Option<u64> {
        self.state
            .lock()
            .local_replica
            .as_ref()
            .map(|r| r.log_end_offset())
    }

    // ------------------------------------------------------------------
    // 4.1 Partition operations
    // ------------------------------------------------------------------

    /// Append records to the local leader log. Fails with `NotLeaderForPartition`
    /// if this partition isn't in Leader mode, or `NotEnoughReplicas` if
    /// `acks = All` and ISR is below the configured minimum.
    pub fn append_to_leader(
        &self,
        records: Vec<Record>,
        required_acks: RequiredAcks,
    ) -> Result<AppendInfo, PartitionError> {
        let (log, isr_len) = {
            let state = self.state.lock();
            if state.mode != PartitionMode::Leader {
                return Err(PartitionError::NotLeaderForPartition);
            }
            if required_acks == RequiredAcks::All && state.isr.len() < self.min_in_sync_replicas {
                return Err(PartitionError::NotEnoughReplicas {
                    have: state.isr.len(),
                    need: self.min_in_sync_replicas,
                });
            }
            let log = state
                .local_replica
                .as_ref()
                .and_then(|r| r.log().cloned())
                .ok_or(PartitionError::ReplicaNotAvailable)?;
            (log, state.isr.len())
        };

        // Log I/O happens without the partition lock held.
        let first_offset = log.read().log_end_offset();
        let last_offset = {
            let mut log = log.write();
            log.append_batch(records)?
        };

        let mut state = self.state.lock();
        if state.mode != PartitionMode::Leader {
            return Err(PartitionError::NotLeaderForPartition);
        }
        if required_acks == RequiredAcks::All && state.isr.len() < self.min_in_sync_replicas {
            return Err(PartitionError::NotEnoughReplicasAfterAppend {
                have: state.isr.len(),
                need: self.min_in_sync_replicas,
            });
        }
        if let Some(local) = state.local_replica.as_mut() {
            local.refresh_from_local_log();
        }
        let advanced = Self::recompute_high_watermark(&mut state);
        let _ = isr_len;

        Ok(AppendInfo {
            first_offset,
            last_offset,
            high_watermark_advanced: advanced,
        })
    }

    /// Read from the local replica. `max_offset`, when given, caps the read (used
    /// to enforce "committed only" reads for consumers, capped at the HW by the
    /// caller before invoking this).
    pub fn read_from_local(
        &self,
        offset: u64,
        max_bytes: Option<usize>,
    ) -> Result<FetchInfo, PartitionError> {
        let (log, high_watermark) = {
            let state = self.state.lock();
            let log = state
                .local_replica
                .as_ref()
                .and_then(|r| r.log().cloned())
                .ok_or(PartitionError::ReplicaNotAvailable)?;
            (log, state.high_watermark)
        };

        let leader_leo_before_read = log.read().log_end_offset();
        if offset > leader_leo_before_read || offset < log.read().log_start_offset() {
            return Err(PartitionError::OffsetOutOfRange {
                requested: offset,
                log_start: log.read().log_start_offset(),
                log_end: leader_leo_before_read,
            });
        }

        let records = log.read().read(offset, max_bytes)?;
        Ok(FetchInfo {
            records,
            leader_log_end_offset_before_read: leader_leo_before_read,
            high_watermark,
        })
    }

    /// Update a follower's fetch-progress view and re-evaluate ISR/HW. The
    /// caller (the replica manager) is responsible for persisting and
    /// propagating an ISR expansion to the coordination store — `Partition`
    /// holds no reference to it.
    pub fn update_follower_fetch_state(
        &self,
        follower_id: BrokerId,
        new_leo: u64,
        leo_at_fetch_start: u64,
        now: DateTime<Utc>,
    ) -> FollowerUpdateOutcome {
        let mut state = self.state.lock();
        if let Some(replica) = state.remote_replicas.get_mut(&follower_id) {
            replica.update_fetch_state(new_leo, leo_at_fetch_start, now);
        } else {
            state
                .remote_replicas
                .insert(follower_id, Replica::new_remote(follower_id, new_leo, now));
        }
        let isr_expanded = self.maybe_expand_isr_locked(&mut state, follower_id);
        let high_watermark_advanced = Self::recompute_high_watermark(&mut state);
        FollowerUpdateOutcome {
            high_watermark_advanced,
            isr_expanded,
        }
    }

    /// Returns `true` iff the follower was newly added to ISR by this call; the
    /// caller is responsible for persisting and propagating that change.
    fn maybe_expand_isr_locked(&self, state: &mut PartitionState, follower_id: BrokerId) -> bool {
        if state.isr.contains(&follower_id) {
            return false;
        }
        let follower_leo = state
            .remote_replicas
            .get(&follower_id)
            .map(|r| r.log_end_offset())
            .unwrap_or(0);
        // ISR re-entry requires reaching the leader's *current HW*, not its LEO —
        // this prevents an oscillating follower from re-entering prematurely.
        if state.assigned_replicas.contains(&follower_id) && follower_leo >= state.high_watermark {
            state.isr.insert(follower_id);
            true
        } else {
            false
        }
    }

    /// Remove from ISR any follower whose `last_caught_up_time` is older than
    /// `now - max_lag`. Never removes the leader's own replica.
    pub fn maybe_shrink_isr(
        &self,
        max_lag: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<BrokerId> {
        let mut state = self.state.lock();
        let leader_id = state.local_replica.as_ref().map(|r| r.broker_id);
        let cutoff = now - max_lag;

        let stale: Vec<BrokerId> = state
            .isr
            .iter()
            .copied()
            .filter(|broker_id| {
                if Some(*broker_id) == leader_id {
                    return false;
                }
                state
                    .remote_replicas
                    .get(broker_id)
                    .map(|r| r.last_caught_up_time() < cutoff)
                    .unwrap_or(false)
            })
            .collect();

        for broker_id in &stale {
            state.isr.remove(broker_id);
        }
        stale
    }

    /// Recompute HW as min LEO over ISR; returns whether it strictly advanced.
    fn recompute_high_watermark(state: &mut PartitionState) -> bool {
        if state.mode != PartitionMode::Leader || state.isr.is_empty() {
            return false;
        }

        let mut min_leo: Option<u64> = None;
        for broker_id in &state.isr {
            let leo = if Some(*broker_id) == state.local_replica.as_ref().map(|r| r.broker_id) {
                state.local_replica.as_ref().map(|r| r.log_end_offset())
            } else {
                state.remote_replicas.get(broker_id).map(|r| r.log_end_offset())
            };
            let Some(leo) = leo else { continue };
            min_leo = Some(min_leo.map_or(leo, |m| m.min(leo)));
        }

        match min_leo {
            Some(candidate) if candidate > state.high_watermark => {
                state.high_watermark = candidate;
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // 4.4 Leader/follower transitions
    // ------------------------------------------------------------------

    /// Transition to Leader mode: bump leader epoch, adopt the controller's ISR,
    /// reset remote replica LEOs to unknown (0), and rebuild HW from the local
    /// LEO capped at the prior HW (never exposes an offset beyond what was
    /// previously committed).
    pub fn make_leader(
        &self,
        controller_epoch: u64,
        leader_epoch: Epoch,
        assigned_replicas: Vec<BrokerId>,
        isr: Vec<BrokerId>,
        checkpointed_high_watermark: u64,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        state.mode = PartitionMode::Leader;
        state.controller_epoch = controller_epoch;
        state.leader_epoch = leader_epoch;
        state.leader_id = None;
        state.assigned_replicas = assigned_replicas;
        state.isr = isr.into_iter().collect();

        let local_leo = self.ensure_local_replica(&mut state, now);
        state.remote_replicas.clear();
        for broker_id in state.isr.clone() {
            if Some(broker_id) != state.local_replica.as_ref().map(|r| r.broker_id) {
                state
                    .remote_replicas
                    .insert(broker_id, Replica::new_remote(broker_id, 0, now));
            }
        }

        state.high_watermark = checkpointed_high_watermark.min(local_leo);
    }

    /// Transition to Follower mode: clear leader role, record the new leader and
    /// epoch, and return the HW to truncate the local log to (the key durability
    /// contract — never retain an uncommitted suffix across a leadership change).
    ///
    /// If no checkpoint entry exists for a newly materialised replica, truncates
    /// to 0 and leaves the partition unable to serve reads until the new leader
    /// supplies a fetch response (an explicit open question in the design this
    /// crate resolves that way).
    pub fn make_follower(
        &self,
        controller_epoch: u64,
        leader_epoch: Epoch,
        leader_id: BrokerId,
        assigned_replicas: Vec<BrokerId>,
        checkpointed_high_watermark: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<u64, PartitionError> {
        let mut state = self.state.lock();
        state.mode = PartitionMode::Follower;
        state.controller_epoch = controller_epoch;
        state.leader_epoch = leader_epoch;
        state.leader_id = Some(leader_id);
        state.assigned_replicas = assigned_replicas;
        state.remote_replicas.clear();

        let truncate_to = checkpointed_high_watermark.unwrap_or(0);
        self.ensure_local_replica(&mut state, now);
        let log = state
            .local_replica
            .as_ref()
            .and_then(|r| r.log().cloned())
            .ok_or(PartitionError::ReplicaNotAvailable)?;
        log.write().truncate_to(truncate_to)?;
        if let Some(local) = state.local_replica.as_mut() {
            local.refresh_from_local_log();
        }
        state.high_watermark = truncate_to;
        Ok(truncate_to)
    }

    /// Transition to Offline: drop leader/follower role entirely. Used by
    /// `stopReplica(delete=false)`.
    pub fn make_offline(&self) {
        let mut state = self.state.lock();
        state.mode = PartitionMode::Offline;
        state.leader_id = None;
        state.remote_replicas.clear();
    }

    fn ensure_local_replica(&self, state: &mut PartitionState, now: DateTime<Utc>) -> u64 {
        if let Some(local) = state.local_replica.as_mut() {
            local.refresh_from_local_log();
            return local.log_end_offset();
        }
        let log = self.backend.create();
        let leo = log.read().log_end_offset();
        state.local_replica = Some(Replica::new_local(self.local_broker_id, log, now));
        leo
    }

    /// Append records fetched from the leader directly into the local log,
    /// without the leader-mode/ISR checks `append_to_leader` enforces. Used by
    /// the fetcher manager to apply a follower fetch response; `leader_high_watermark`
    /// is the HW the leader reported alongside those records.
    pub fn append_as_follower(
        &self,
        records: Vec<Record>,
        leader_high_watermark: u64,
    ) -> Result<AppendInfo, PartitionError> {
        let log = {
            let state = self.state.lock();
            if state.mode != PartitionMode::Follower {
                return Err(PartitionError::NotLeaderForPartition);
            }
            state
                .local_replica
                .as_ref()
                .and_then(|r| r.log().cloned())
                .ok_or(PartitionError::ReplicaNotAvailable)?
        };

        let first_offset = log.read().log_end_offset();
        let last_offset = log.write().append_batch(records)?;

        let mut state = self.state.lock();
        if let Some(local) = state.local_replica.as_mut() {
            local.refresh_from_local_log();
            let leo = local.log_end_offset();
            let advanced = leader_high_watermark.min(leo) > state.high_watermark;
            state.high_watermark = leader_high_watermark.min(leo).max(state.high_watermark);
            return Ok(AppendInfo {
                first_offset,
                last_offset,
                high_watermark_advanced: advanced,
            });
        }
        Err(PartitionError::ReplicaNotAvailable)
    }

    /// The leader broker id for a `Follower` partition, if known.
    pub fn leader_id(&self) -> Option<BrokerId> {
        self.state.lock().leader_id
    }

    pub fn controller_epoch(&self) -> u64 {
        self.state.lock().controller_epoch
    }

    /// Local log handle, for the replica manager's truncate-on-follower-transition
    /// and delete-on-stop-replica paths.
    pub fn local_log(&self) -> Option<Arc<parking_lot::RwLock<dyn ReplicationLog>>> {
        self.state
            .lock()
            .local_replica
            .as_ref()
            .and_then(|r| r.log().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicator_storage::PartitionId;

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", PartitionId::new(0))
    }

    fn leader_partition(min_in_sync: usize, isr: Vec<BrokerId>) -> Partition {
        let partition = Partition::new(tp(), BrokerId(1), min_in_sync, StorageBackend::Memory);
        partition.make_leader(7, Epoch(1), vec![BrokerId(1), BrokerId(2), BrokerId(3)], isr, 0, Utc::now());
        partition
    }

    fn record(value: &str) -> Record {
        Record::new(None, value.to_string(), None)
    }

    #[test]
    fn test_append_to_leader_rejects_non_leader() {
        let partition = Partition::new(tp(), BrokerId(1), 1, StorageBackend::Memory);
        let err = partition
            .append_to_leader(vec![record("x")], RequiredAcks::All)
            .unwrap_err();
        assert_eq!(err, PartitionError::NotLeaderForPartition);
    }

    #[test]
    fn test_append_to_leader_acks_all_requires_min_isr() {
        let partition = leader_partition(2, vec![BrokerId(1)]);
        let err = partition
            .append_to_leader(vec![record("x")], RequiredAcks::All)
            .unwrap_err();
        assert_eq!(err, PartitionError::NotEnoughReplicas { have: 1, need: 2 });
    }

    #[test]
    fn test_append_to_leader_acks_none_ignores_isr_size() {
        let partition = leader_partition(2, vec![BrokerId(1)]);
        let info = partition
            .append_to_leader(vec![record("x")], RequiredAcks::None)
            .unwrap();
        assert_eq!(info.first_offset, 0);
        assert_eq!(info.last_offset, 0);
    }

    #[test]
    fn test_high_watermark_advances_only_once_every_isr_member_catches_up() {
        let partition = leader_partition(1, vec![BrokerId(1), BrokerId(2), BrokerId(3)]);
        partition
            .append_to_leader(vec![record("x")], RequiredAcks::All)
            .unwrap();
        assert_eq!(partition.high_watermark(), 0);

        let now = Utc::now();
        let outcome = partition.update_follower_fetch_state(BrokerId(2), 1, 1, now);
        assert!(!outcome.high_watermark_advanced, "HW must not advance until every ISR member reaches LEO 1");

        let outcome = partition.update_follower_fetch_state(BrokerId(3), 1, 1, now);
        assert!(outcome.high_watermark_advanced);
        assert_eq!(partition.high_watermark(), 1);
    }

    #[test]
    fn test_isr_expansion_requires_reaching_leader_hw_not_leo() {
        // ISR = {leader} only, so HW tracks the leader's own LEO immediately.
        let partition = leader_partition(1, vec![BrokerId(1)]);
        partition
            .append_to_leader(vec![record("x"), record("y")], RequiredAcks::None)
            .unwrap();
        assert_eq!(partition.high_watermark(), 2);

        let now = Utc::now();
        partition.update_follower_fetch_state(BrokerId(2), 1, 2, now);
        assert!(
            !partition.in_sync_replicas().contains(&BrokerId(2)),
            "a follower below the current HW must not re-enter ISR"
        );

        partition.update_follower_fetch_state(BrokerId(2), 2, 2, now);
        assert!(partition.in_sync_replicas().contains(&BrokerId(2)));
    }

    #[test]
    fn test_maybe_shrink_isr_never_removes_leader() {
        let partition = leader_partition(1, vec![BrokerId(1), BrokerId(2)]);
        let now = Utc::now();
        partition.update_follower_fetch_state(BrokerId(2), 0, 0, now - chrono::Duration::seconds(120));

        let removed = partition.maybe_shrink_isr(chrono::Duration::seconds(30), now);
        assert_eq!(removed, vec![BrokerId(2)]);
        assert!(partition.in_sync_replicas().contains(&BrokerId(1)));
        assert!(!partition.in_sync_replicas().contains(&BrokerId(2)));
    }

    #[test]
    fn test_make_follower_truncates_log_to_checkpointed_hw() {
        let partition = leader_partition(1, vec![BrokerId(1)]);
        partition
            .append_to_leader(vec![record("x"), record("y"), record("z")], RequiredAcks::None)
            .unwrap();
        assert_eq!(partition.log_end_offset(), Some(3));

        let truncated_to = partition
            .make_follower(8, Epoch(2), BrokerId(2), vec![BrokerId(1), BrokerId(2)], Some(1), Utc::now())
            .unwrap();
        assert_eq!(truncated_to, 1);
        assert_eq!(partition.log_end_offset(), Some(1));
        assert_eq!(partition.mode(), PartitionMode::Follower);
        assert_eq!(partition.leader_id(), Some(BrokerId(2)));
    }

    #[test]
    fn test_make_follower_with_no_checkpoint_truncates_to_zero() {
        let partition = Partition::new(tp(), BrokerId(3), 1, StorageBackend::Memory);
        let truncated_to = partition
            .make_follower(1, Epoch(1), BrokerId(2), vec![BrokerId(2), BrokerId(3)], None, Utc::now())
            .unwrap();
        assert_eq!(truncated_to, 0);
    }

    #[test]
    fn test_append_as_follower_mirrors_leader_high_watermark() {
        let partition = Partition::new(tp(), BrokerId(3), 1, StorageBackend::Memory);
        partition.make_follower(1, Epoch(1), BrokerId(2), vec![BrokerId(2), BrokerId(3)], None, Utc::now()).unwrap();

        let info = partition
            .append_as_follower(vec![record("x"), record("y")], 1)
            .unwrap();
        assert_eq!(info.last_offset, 1);
        assert_eq!(partition.high_watermark(), 1);
        assert!(info.high_watermark_advanced);
    }
}
