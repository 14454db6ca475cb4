//! Top-level coordinator: request dispatch, role transitions, ISR propagation,
//! and periodic maintenance.
//!
//! `ReplicaManager` is the only piece of this crate that knows about every
//! other module at once. Everything it touches downstream (`Partition`,
//! `FetcherManager`, the purgatories) is deliberately ignorant of it, per the
//! narrow-callback resolution of the Partition<->ReplicaManager cycle in the
//! design notes: those types return rich outcome values and this module is
//! the one place that interprets them and drives side effects (ISR
//! persistence, fetcher registration, purgatory wakeups).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use replicator_cluster::types::{BrokerRuntimeStatus, PartitionRuntimeState};
use replicator_cluster::{ClusterError, MetadataStore};
use replicator_storage::{Record, RecordWithOffset, StorageBackend};

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicaManagerConfig;
use crate::error::{PartitionError, RequestError, StorageFailure};
use crate::fetcher::{
    FetchRequest as UpstreamFetchRequest, FetchResponse as UpstreamFetchResponse, FetchTarget,
    FetcherManager, LeaderClient,
};
use crate::partition::{Partition, PartitionMode};
use crate::purgatory::{DelayedOperation, Purgatory};
use crate::types::{BrokerId, Epoch, FetcherId, RequiredAcks, TopicPartition};

pub use log::{debug, error, info, trace, warn};

// ---------------------------------------------------------------------
// Controller-facing request/response shapes
// ---------------------------------------------------------------------

/// One partition's worth of a `LeaderAndIsr` request.
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub topic: String,
    pub partition: replicator_storage::PartitionId,
    pub controller_epoch: u64,
    pub leader: BrokerId,
    pub leader_epoch: Epoch,
    pub isr: Vec<BrokerId>,
    pub all_replicas: Vec<BrokerId>,
}

/// Per-partition change reported out of `become_leader_or_follower`.
#[derive(Debug, Clone, Default)]
pub struct LeadershipChange {
    pub became_leader: Vec<TopicPartition>,
    pub became_follower: Vec<TopicPartition>,
}

/// Response to a `LeaderAndIsr`/`StopReplica` call: a global error (if the whole
/// request was rejected) plus a per-partition error map.
#[derive(Debug, Clone, Default)]
pub struct ControllerResponse {
    pub global_error: Option<RequestError>,
    pub partition_errors: HashMap<TopicPartition, PartitionError>,
}

// ---------------------------------------------------------------------
// Produce path
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ProducePartitionResult {
    pub offset: Option<u64>,
    pub error: Option<PartitionError>,
}

pub type ProduceResponse = HashMap<TopicPartition, ProducePartitionResult>;
pub type ProduceCallback = Box<dyn FnOnce(ProduceResponse) + Send>;

struct ProduceTarget {
    topic_partition: TopicPartition,
    first_offset: u64,
    required_offset: u64,
}

/// A produce call parked because `acks = all` and the write hadn't yet reached
/// every ISR member's LEO. Holds no manager reference; it re-reads partition
/// state out of a shared handle table each time it is asked to complete.
struct DelayedProduce {
    partitions: Arc<DashMap<TopicPartition, Arc<Partition>>>,
    targets: Vec<ProduceTarget>,
    initial_errors: HashMap<TopicPartition, PartitionError>,
    callback: Mutex<Option<ProduceCallback>>,
}

impl DelayedProduce {
    fn evaluate(&self) -> (bool, ProduceResponse) {
        let mut snapshot: ProduceResponse = self
            .initial_errors
            .iter()
            .map(|(tp, err)| {
                (
                    tp.clone(),
                    ProducePartitionResult {
                        offset: None,
                        error: Some(err.clone()),
                    },
                )
            })
            .collect();

        let mut all_done = true;
        for target in &self.targets {
            let resolved = match self.partitions.get(&target.topic_partition) {
                Some(partition) if partition.mode() == PartitionMode::Leader => {
                    if partition.high_watermark() >= target.required_offset {
                        Some(ProducePartitionResult {
                            offset: Some(target.first_offset),
                            error: None,
                        })
                    } else {
                        None
                    }
                }
                _ => Some(ProducePartitionResult {
                    offset: None,
                    error: Some(PartitionError::NotLeaderForPartition),
                }),
            };
            match resolved {
                Some(result) => {
                    snapshot.insert(target.topic_partition.clone(), result);
                }
                None => all_done = false,
            }
        }
        (all_done, snapshot)
    }
}

impl DelayedOperation for DelayedProduce {
    fn try_complete(&self) -> bool {
        self.evaluate().0
    }

    fn on_complete(&self, timed_out: bool) {
        let (_, mut snapshot) = self.evaluate();
        if timed_out {
            for target in &self.targets {
                snapshot
                    .entry(target.topic_partition.clone())
                    .or_insert(ProducePartitionResult {
                        offset: None,
                        error: Some(PartitionError::RequestTimedOut),
                    });
            }
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(snapshot);
        }
    }
}

// ---------------------------------------------------------------------
// Fetch path
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PerPartitionFetchInfo {
    pub topic_partition: TopicPartition,
    pub offset: u64,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPartitionResult {
    pub high_watermark: u64,
    pub records: Vec<RecordWithOffset>,
    pub error: Option<PartitionError>,
}

pub type FetchResponse = HashMap<TopicPartition, FetchPartitionResult>;
pub type FetchCallback = Box<dyn FnOnce(FetchResponse) + Send>;

struct DelayedFetch {
    partitions: Arc<DashMap<TopicPartition, Arc<Partition>>>,
    targets: Vec<PerPartitionFetchInfo>,
    fetcher_id: FetcherId,
    min_bytes: usize,
    initial_errors: HashMap<TopicPartition, PartitionError>,
    callback: Mutex<Option<FetchCallback>>,
}

impl DelayedFetch {
    /// Re-reads every target partition at the current moment and tallies the
    /// total accumulated bytes read so far. Mirrors `read_partition_for_fetch`
    /// in `ReplicaManager` but stays free of a manager reference.
    fn evaluate(&self) -> (bool, usize, FetchResponse) {
        let mut snapshot: FetchResponse = self
            .initial_errors
            .iter()
            .map(|(tp, err)| {
                (
                    tp.clone(),
                    FetchPartitionResult {
                        high_watermark: 0,
                        records: Vec::new(),
                        error: Some(err.clone()),
                    },
                )
            })
            .collect();

        let mut total_bytes = 0usize;
        let mut any_error = false;
        for target in &self.targets {
            let result = read_one_partition(&self.partitions, target, self.fetcher_id);
            match &result.error {
                Some(_) => any_error = true,
                None => total_bytes += fetch_result_byte_size(&result),
            }
            snapshot.insert(target.topic_partition.clone(), result);
        }

        let satisfied = any_error || total_bytes >= self.min_bytes;
        (satisfied, total_bytes, snapshot)
    }
}

impl DelayedOperation for DelayedFetch {
    fn try_complete(&self) -> bool {
        self.evaluate().0
    }

    fn on_complete(&self, _timed_out: bool) {
        let (_, _, snapshot) = self.evaluate();
        if let Some(callback) = self.callback.lock().take() {
            callback(snapshot);
        }
    }
}

fn read_one_partition(
    partitions: &DashMap<TopicPartition, Arc<Partition>>,
    target: &PerPartitionFetchInfo,
    fetcher_id: FetcherId,
) -> FetchPartitionResult {
    let partition = match partitions.get(&target.topic_partition) {
        Some(p) => p,
        None => {
            return FetchPartitionResult {
                high_watermark: 0,
                records: Vec::new(),
                error: Some(PartitionError::UnknownTopicOrPartition),
            };
        }
    };

    if !fetcher_id.is_follower() && !matches!(fetcher_id, FetcherId::Debug) && partition.mode() != PartitionMode::Leader
    {
        return FetchPartitionResult {
            high_watermark: 0,
            records: Vec::new(),
            error: Some(PartitionError::NotLeaderForPartition),
        };
    }

    match partition.read_from_local(target.offset, Some(target.max_bytes)) {
        Ok(info) => {
            let records = if fetcher_id.caps_at_high_watermark() {
                info.records
                    .into_iter()
                    .filter(|r| r.offset < info.high_watermark)
                    .collect()
            } else {
                info.records
            };
            FetchPartitionResult {
                high_watermark: info.high_watermark,
                records,
                error: None,
            }
        }
        Err(err) => FetchPartitionResult {
            high_watermark: 0,
            records: Vec::new(),
            error: Some(err),
        },
    }
}

/// Wire-size estimate of a partition's fetched records, used to evaluate
/// `minBytes` against actual payload size rather than record count.
fn fetch_result_byte_size(result: &FetchPartitionResult) -> usize {
    result.records.iter().map(|r| r.estimated_size()).sum()
}

// ---------------------------------------------------------------------
// ReplicaManager
// ---------------------------------------------------------------------

/// Serialises `become_leader_or_follower` / `stop_replicas` metadata updates
/// against each other. Held only long enough to validate/adopt the
/// controller epoch — never across partition bucketing or log/checkpoint I/O.
struct ControllerState {
    controller_epoch: u64,
}

struct IsrChangeTracker {
    changed: Mutex<HashSet<TopicPartition>>,
    last_change: Mutex<DateTime<Utc>>,
    last_propagation: Mutex<DateTime<Utc>>,
}

impl IsrChangeTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            changed: Mutex::new(HashSet::new()),
            last_change: Mutex::new(now),
            last_propagation: Mutex::new(now),
        }
    }

    fn record_change(&self, tp: TopicPartition, now: DateTime<Utc>) {
        self.changed.lock().insert(tp);
        *self.last_change.lock() = now;
    }

    /// Decide whether to propagate now under the quiet-period/forced-interval
    /// batching rule, draining the change set if so.
    fn drain_if_due(&self, now: DateTime<Utc>, blackout: Duration, forced: Duration) -> Option<HashSet<TopicPartition>> {
        let mut changed = self.changed.lock();
        if changed.is_empty() {
            return None;
        }
        let last_change = *self.last_change.lock();
        let last_propagation = *self.last_propagation.lock();
        let quiet_long_enough = now - last_change >= chrono::Duration::from_std(blackout).unwrap();
        let forced_due = now - last_propagation >= chrono::Duration::from_std(forced).unwrap();
        if quiet_long_enough || forced_due {
            let drained = std::mem::take(&mut *changed);
            *self.last_propagation.lock() = now;
            Some(drained)
        } else {
            None
        }
    }
}

/// Background periodic jobs, tracked so shutdown can join them cleanly.
///
/// Each named job is a `loop { sleep(interval); tick() }` body; `spawn` wraps
/// it with the shared shutdown flag so every job checks it once per tick
/// rather than each call site re-implementing the same check.
struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn spawn(&self, name: &str, interval: Duration, mut tick: impl FnMut() + Send + 'static) {
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    tick();
                }
            })
            .expect("failed to spawn background task thread");
        self.handles.lock().push(handle);
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Top-level Replica Manager: owns the partition table, the produce/fetch
/// purgatories, the ISR change tracker, the checkpoint store, and the
/// background scheduler.
pub struct ReplicaManager {
    config: ReplicaManagerConfig,
    metadata_store: Arc<dyn MetadataStore>,
    partitions: Arc<DashMap<TopicPartition, Arc<Partition>>>,
    controller: Mutex<ControllerState>,
    hw_checkpoint_started: AtomicBool,
    isr_changes: Arc<IsrChangeTracker>,
    checkpoints: Arc<CheckpointStore>,
    produce_purgatory: Purgatory<TopicPartition, DelayedProduce>,
    fetch_purgatory: Purgatory<TopicPartition, DelayedFetch>,
    fetcher_manager: Mutex<Option<Arc<FetcherManager>>>,
    scheduler: Scheduler,
}

impl ReplicaManager {
    pub fn new(config: ReplicaManagerConfig, metadata_store: Arc<dyn MetadataStore>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            config,
            metadata_store,
            partitions: Arc::new(DashMap::new()),
            controller: Mutex::new(ControllerState { controller_epoch: 0 }),
            hw_checkpoint_started: AtomicBool::new(false),
            isr_changes: Arc::new(IsrChangeTracker::new(now)),
            checkpoints: Arc::new(CheckpointStore::new()),
            produce_purgatory: Purgatory::new(),
            fetch_purgatory: Purgatory::new(),
            fetcher_manager: Mutex::new(None),
            scheduler: Scheduler::new(),
        })
    }

    /// Wire in a fetcher manager for follower replication. Must be called once
    /// at startup before any `become_leader_or_follower` assigns follower
    /// partitions; the manager registers itself as the `FetchTarget`.
    pub fn attach_fetcher_manager(self: &Arc<Self>, client: Arc<dyn LeaderClient>, fetch_interval: Duration) {
        let target: Arc<dyn FetchTarget> = Arc::new(ReplicaManagerFetchTarget {
            manager: Arc::downgrade(self),
        });
        let fetcher = Arc::new(FetcherManager::new(client, target, fetch_interval));
        *self.fetcher_manager.lock() = Some(fetcher);
    }

    fn fetcher(&self) -> Option<Arc<FetcherManager>> {
        self.fetcher_manager.lock().clone()
    }

    fn get_or_create_partition(&self, tp: &TopicPartition) -> Arc<Partition> {
        if let Some(existing) = self.partitions.get(tp) {
            return Arc::clone(existing.value());
        }
        let created = Arc::new(Partition::new(
            tp.clone(),
            self.config.broker_id,
            self.config.min_in_sync_replicas,
            StorageBackend::Memory,
        ));
        Arc::clone(
            self.partitions
                .entry(tp.clone())
                .or_insert(created)
                .value(),
        )
    }

    // -------------------------------------------------------------
    // 4.2 Produce path
    // -------------------------------------------------------------

    pub fn append_messages(
        &self,
        timeout: Duration,
        required_acks: i16,
        allow_internal_topics: bool,
        per_partition_records: HashMap<TopicPartition, Vec<Record>>,
        on_complete: ProduceCallback,
    ) {
        let Some(required_acks) = RequiredAcks::from_i16(required_acks) else {
            warn!("rejecting produce with invalid required_acks={required_acks}");
            let response = per_partition_records
                .keys()
                .map(|tp| {
                    (
                        tp.clone(),
                        ProducePartitionResult {
                            offset: None,
                            error: Some(PartitionError::InvalidRequiredAcks {
                                requested: required_acks,
                            }),
                        },
                    )
                })
                .collect();
            on_complete(response);
            return;
        };

        let mut initial_errors = HashMap::new();
        let mut targets = Vec::new();
        let mut any_records = false;
        let mut any_success = false;

        for (tp, records) in per_partition_records {
            if !allow_internal_topics && tp.topic.starts_with("__") {
                initial_errors.insert(
                    tp.clone(),
                    PartitionError::InvalidTopic {
                        topic: tp.topic.clone(),
                    },
                );
                continue;
            }
            if !records.is_empty() {
                any_records = true;
            }

            let partition = self.get_or_create_partition(&tp);
            match partition.append_to_leader(records, required_acks) {
                Ok(info) => {
                    any_success = true;
                    self.maybe_enqueue_isr_change_from_append(&tp, &partition);
                    targets.push(ProduceTarget {
                        topic_partition: tp,
                        first_offset: info.first_offset,
                        required_offset: info.last_offset + 1,
                    });
                }
                Err(PartitionError::Unknown { reason }) => {
                    error!("unexpected error appending to {tp}: {reason}");
                    initial_errors.insert(tp, PartitionError::Unknown { reason });
                }
                Err(err) => {
                    initial_errors.insert(tp, err);
                }
            }
        }

        let should_delay = required_acks == RequiredAcks::All && any_records && any_success;
        if !should_delay {
            let mut response: ProduceResponse = initial_errors
                .into_iter()
                .map(|(tp, err)| {
                    (
                        tp,
                        ProducePartitionResult {
                            offset: None,
                            error: Some(err),
                        },
                    )
                })
                .collect();
            for target in targets {
                response.insert(
                    target.topic_partition,
                    ProducePartitionResult {
                        offset: Some(target.first_offset),
                        error: None,
                    },
                );
            }
            on_complete(response);
            return;
        }

        let keys: Vec<TopicPartition> = targets.iter().map(|t| t.topic_partition.clone()).collect();
        let op = DelayedProduce {
            partitions: Arc::clone(&self.partitions),
            targets,
            initial_errors,
            callback: Mutex::new(Some(on_complete)),
        };
        self.produce_purgatory.try_complete_else_watch(op, keys, timeout);
    }

    fn maybe_enqueue_isr_change_from_append(&self, _tp: &TopicPartition, _partition: &Partition) {
        // Appends don't themselves change ISR membership; kept as a hook so
        // future callers (e.g. a manual ISR nudge) share the same entry point
        // as `on_follower_fetch`.
    }

    // -------------------------------------------------------------
    // 4.3 Fetch path
    // -------------------------------------------------------------

    pub fn fetch_messages(
        &self,
        timeout: Duration,
        fetcher_id: FetcherId,
        min_bytes: usize,
        per_partition_fetch_info: Vec<PerPartitionFetchInfo>,
        on_complete: FetchCallback,
    ) {
        if let FetcherId::Follower(broker_id) = fetcher_id {
            self.apply_follower_progress(broker_id, &per_partition_fetch_info, Utc::now());
        }

        let targets = per_partition_fetch_info;
        let no_partitions = targets.is_empty();

        let mut response: FetchResponse = HashMap::new();
        let mut total_bytes = 0usize;
        let mut any_error = false;
        for target in &targets {
            let result = read_one_partition(&self.partitions, target, fetcher_id);
            if result.error.is_some() {
                any_error = true;
            } else {
                total_bytes += fetch_result_byte_size(&result);
            }
            response.insert(target.topic_partition.clone(), result);
        }

        let respond_now =
            timeout.is_zero() || no_partitions || total_bytes >= min_bytes || any_error;
        if respond_now {
            on_complete(response);
            return;
        }

        let keys: Vec<TopicPartition> = targets.iter().map(|t| t.topic_partition.clone()).collect();
        let op = DelayedFetch {
            partitions: Arc::clone(&self.partitions),
            targets,
            fetcher_id,
            min_bytes,
            initial_errors: HashMap::new(),
            callback: Mutex::new(Some(on_complete)),
        };
        self.fetch_purgatory.try_complete_else_watch(op, keys, timeout);
    }

    /// Applies a follower's reported progress to each partition it fetched,
    /// then wakes any delayed produce that may now be satisfiable. Shared by
    /// the synchronous follower-fetch path and `ReplicaManagerFetchTarget`.
    fn apply_follower_progress(
        &self,
        follower_id: BrokerId,
        fetched: &[PerPartitionFetchInfo],
        now: DateTime<Utc>,
    ) {
        for info in fetched {
            let Some(partition) = self.partitions.get(&info.topic_partition) else {
                continue;
            };
            let leo_at_fetch_start = partition
                .log_end_offset()
                .unwrap_or(info.offset);
            let outcome =
                partition.update_follower_fetch_state(follower_id, info.offset, leo_at_fetch_start, now);
            if outcome.isr_expanded {
                self.persist_isr(&info.topic_partition, &partition);
                self.isr_changes.record_change(info.topic_partition.clone(), now);
            }
            if outcome.high_watermark_advanced {
                self.produce_purgatory.check_and_complete(&info.topic_partition);
            }
        }
    }

    fn persist_isr(&self, tp: &TopicPartition, partition: &Partition) {
        let isr: Vec<BrokerId> = partition.in_sync_replicas().into_iter().collect();
        for broker_id in &isr {
            if let Err(err) = self.metadata_store.update_in_sync_replica(
                &tp.topic,
                tp.partition,
                *broker_id,
                true,
            ) {
                warn!("failed to persist ISR membership for {tp}: {err}");
            }
        }
    }

    // -------------------------------------------------------------
    // 4.4 Leader/follower transitions
    // -------------------------------------------------------------

    pub fn become_leader_or_follower(
        &self,
        controller_id: BrokerId,
        controller_epoch: u64,
        partition_states: Vec<PartitionState>,
    ) -> ControllerResponse {
        {
            let mut controller = self.controller.lock();
            if controller_epoch < controller.controller_epoch {
                return ControllerResponse {
                    global_error: Some(RequestError::StaleControllerEpoch {
                        current: controller.controller_epoch,
                        requested: controller_epoch,
                    }),
                    partition_errors: HashMap::new(),
                };
            }
            controller.controller_epoch = controller_epoch;
        }

        let mut leader_bucket = Vec::new();
        let mut follower_bucket = Vec::new();
        let mut partition_errors = HashMap::new();
        let now = Utc::now();

        for state in partition_states {
            let tp = TopicPartition::new(state.topic.clone(), state.partition);
            let partition = self.get_or_create_partition(&tp);
            let current_epoch = partition.leader_epoch();
            if current_epoch.0 > 0 && current_epoch >= state.leader_epoch {
                partition_errors.insert(
                    tp,
                    PartitionError::StaleLeaderEpoch {
                        current: current_epoch.0,
                        requested: state.leader_epoch.0,
                    },
                );
                continue;
            }
            if !state.all_replicas.contains(&self.config.broker_id) {
                partition_errors.insert(tp, PartitionError::UnknownTopicOrPartition);
                continue;
            }

            if state.leader == self.config.broker_id {
                leader_bucket.push((tp, partition, state));
            } else {
                follower_bucket.push((tp, partition, state));
            }
        }

        let mut change = LeadershipChange::default();
        self.make_leaders(&mut change, leader_bucket, now);
        self.make_followers(&mut change, follower_bucket, now);

        if self
            .hw_checkpoint_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.start_background_tasks();
        }

        if let Some(fetcher) = self.fetcher() {
            fetcher.shutdown_idle_loops();
        }

        ControllerResponse {
            global_error: None,
            partition_errors,
        }
    }

    fn make_leaders(
        &self,
        change: &mut LeadershipChange,
        bucket: Vec<(TopicPartition, Arc<Partition>, PartitionState)>,
        now: DateTime<Utc>,
    ) {
        if bucket.is_empty() {
            return;
        }
        let tps: Vec<TopicPartition> = bucket.iter().map(|(tp, _, _)| tp.clone()).collect();
        if let Some(fetcher) = self.fetcher() {
            fetcher.remove_partitions(&tps);
        }

        for (tp, partition, state) in bucket {
            let checkpointed_hw = self
                .checkpoints
                .read(&self.config.data_dir)
                .ok()
                .and_then(|entries| entries.get(&tp).copied())
                .unwrap_or(0);
            partition.make_leader(
                state.controller_epoch,
                state.leader_epoch,
                state.all_replicas,
                state.isr,
                checkpointed_hw,
                now,
            );
            change.became_leader.push(tp);
        }
    }

    fn make_followers(
        &self,
        change: &mut LeadershipChange,
        bucket: Vec<(TopicPartition, Arc<Partition>, PartitionState)>,
        now: DateTime<Utc>,
    ) {
        if bucket.is_empty() {
            return;
        }
        let tps: Vec<TopicPartition> = bucket.iter().map(|(tp, _, _)| tp.clone()).collect();
        if let Some(fetcher) = self.fetcher() {
            fetcher.remove_partitions(&tps);
        }

        for (tp, partition, state) in bucket {
            let checkpointed_hw = self
                .checkpoints
                .read(&self.config.data_dir)
                .ok()
                .and_then(|entries| entries.get(&tp).copied());

            match partition.make_follower(
                state.controller_epoch,
                state.leader_epoch,
                state.leader,
                state.all_replicas,
                checkpointed_hw,
                now,
            ) {
                Ok(_truncated_to) => {
                    self.produce_purgatory.check_and_complete(&tp);
                    self.fetch_purgatory.check_and_complete(&tp);
                    change.became_follower.push(tp.clone());

                    if let Some(fetcher) = self.fetcher() {
                        let start_offset = partition.log_end_offset().unwrap_or(0);
                        fetcher.add_partitions(state.leader, vec![(tp, start_offset)]);
                    }
                }
                Err(err) => {
                    error!("failed to truncate {tp} on become-follower: {err}");
                }
            }
        }
    }

    /// `StopReplica(deletePartitions, partitions)`.
    pub fn stop_replicas(
        &self,
        controller_epoch: u64,
        delete_partitions: bool,
        partitions: Vec<TopicPartition>,
    ) -> ControllerResponse {
        let controller = self.controller.lock();
        if controller_epoch < controller.controller_epoch {
            return ControllerResponse {
                global_error: Some(RequestError::StaleControllerEpoch {
                    current: controller.controller_epoch,
                    requested: controller_epoch,
                }),
                partition_errors: HashMap::new(),
            };
        }
        drop(controller);

        if let Some(fetcher) = self.fetcher() {
            fetcher.remove_partitions(&partitions);
        }

        let mut partition_errors = HashMap::new();
        for tp in partitions {
            let Some((_, partition)) = self.partitions.remove_entry(&tp) else {
                partition_errors.insert(tp, PartitionError::UnknownTopicOrPartition);
                continue;
            };

            self.produce_purgatory.check_and_complete(&tp);
            self.fetch_purgatory.check_and_complete(&tp);

            if delete_partitions {
                if let Some(log) = partition.local_log() {
                    if let Err(err) = log.write().delete() {
                        error!("failed to delete log for {tp}: {err}");
                    }
                }
            } else {
                partition.make_offline();
                self.partitions.insert(tp.clone(), partition);
            }
        }

        if let Some(fetcher) = self.fetcher() {
            fetcher.shutdown_idle_loops();
        }

        ControllerResponse {
            global_error: None,
            partition_errors,
        }
    }

    // -------------------------------------------------------------
    // 4.5 - 4.6 Background maintenance
    // -------------------------------------------------------------

    /// Spawns the three named periodic jobs. Every closure below closes
    /// over `Arc` clones only, never `&self`, so this never needs `self` to
    /// outlive the threads by anything more than `shutdown()` joining them.
    fn start_background_tasks(&self) {
        let partitions = Arc::clone(&self.partitions);
        let max_lag = chrono::Duration::from_std(self.config.replica_lag_time_max).unwrap();
        let expiration_interval = self.config.isr_expiration_interval;
        let metadata_store = Arc::clone(&self.metadata_store);
        self.scheduler.spawn("isr-expiration", expiration_interval, move || {
            let now = Utc::now();
            for entry in partitions.iter() {
                let tp = entry.key().clone();
                let removed = entry.value().maybe_shrink_isr(max_lag, now);
                for broker_id in removed {
                    if let Err(err) =
                        metadata_store.update_in_sync_replica(&tp.topic, tp.partition, broker_id, false)
                    {
                        warn!("failed to persist ISR shrink for {tp}: {err}");
                    }
                }
            }
        });

        let propagation_interval = self.config.isr_propagation_interval;
        let blackout = self.config.isr_propagation_blackout;
        let forced_interval = self.config.isr_propagation_forced_interval;
        let partitions_for_propagation = Arc::clone(&self.partitions);
        let metadata_store_for_propagation = Arc::clone(&self.metadata_store);
        let isr_changes = Arc::clone(&self.isr_changes);
        self.scheduler.spawn("isr-change-propagation", propagation_interval, move || {
            let Some(drained) = isr_changes.drain_if_due(Utc::now(), blackout, forced_interval) else {
                return;
            };
            for tp in drained {
                if let Some(partition) = partitions_for_propagation.get(&tp) {
                    let isr: Vec<BrokerId> = partition.in_sync_replicas().into_iter().collect();
                    for broker_id in isr {
                        let _ = metadata_store_for_propagation.update_in_sync_replica(
                            &tp.topic,
                            tp.partition,
                            broker_id,
                            true,
                        );
                    }
                }
            }
        });

        let checkpoint_interval = self.config.high_watermark_checkpoint_interval;
        let data_dir = self.config.data_dir.clone();
        let partitions_for_checkpoint = Arc::clone(&self.partitions);
        let checkpoints = Arc::clone(&self.checkpoints);
        self.scheduler.spawn("highwatermark-checkpoint", checkpoint_interval, move || {
            let entries: HashMap<TopicPartition, u64> = partitions_for_checkpoint
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().high_watermark()))
                .collect();
            if let Err(err) = checkpoints.checkpoint(&data_dir, &entries) {
                error!("fatal: high watermark checkpoint failed: {err}");
                std::process::exit(1);
            }
        });
    }

    /// Synchronous HW checkpoint, used both by the background task and by
    /// `shutdown` (which must checkpoint before the process exits).
    fn checkpoint_now(&self) -> Result<(), StorageFailure> {
        let entries: HashMap<TopicPartition, u64> = self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().high_watermark()))
            .collect();
        self.checkpoints.checkpoint(&self.config.data_dir, &entries)
    }

    pub fn high_watermark(&self, tp: &TopicPartition) -> Option<u64> {
        self.partitions.get(tp).map(|p| p.high_watermark())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Heartbeat this broker into the coordination store; exposed so a
    /// caller-owned liveness loop can drive it on whatever cadence it likes
    /// (liveness/cluster-membership discovery itself is out of scope here).
    pub fn heartbeat(&self, draining: bool) -> Result<(), ClusterError> {
        self.metadata_store
            .record_broker_heartbeat(self.config.broker_id, Utc::now(), draining)
    }

    pub fn known_brokers(&self) -> Result<Vec<(BrokerId, BrokerRuntimeStatus)>, ClusterError> {
        self.metadata_store.list_brokers_with_status()
    }

    /// Drain purgatories, stop fetchers, and checkpoint HW synchronously
    /// before exit.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(fetcher) = self.fetcher() {
            fetcher.shutdown_all();
        }
        for entry in self.partitions.iter() {
            self.produce_purgatory.check_and_complete(entry.key());
            self.fetch_purgatory.check_and_complete(entry.key());
        }
        if let Err(err) = self.checkpoint_now() {
            error!("checkpoint failed during shutdown: {err}");
        }
    }
}

/// Wires `ReplicaManager` into `FetcherManager` as the narrow `FetchTarget`
/// callback: the fetcher loop never sees `ReplicaManager` itself, only
/// this adapter, and a weak reference so the fetcher never keeps the manager
/// alive past its own shutdown.
struct ReplicaManagerFetchTarget {
    manager: std::sync::Weak<ReplicaManager>,
}

impl FetchTarget for ReplicaManagerFetchTarget {
    fn apply_fetch_response(&self, response: UpstreamFetchResponse) -> Option<u64> {
        let manager = self.manager.upgrade()?;
        if response.error.is_some() {
            return None;
        }
        let partition = manager.partitions.get(&response.topic_partition)?;
        match partition.append_as_follower(
            response.records.into_iter().map(|r| r.record).collect(),
            response.high_watermark,
        ) {
            Ok(info) => {
                if info.high_watermark_advanced {
                    manager.fetch_purgatory.check_and_complete(&response.topic_partition);
                }
                partition.log_end_offset()
            }
            Err(err) => {
                warn!(
                    "follower append failed for {}: {err}",
                    response.topic_partition
                );
                None
            }
        }
    }
}

/// Outbound `LeaderClient` that turns `FetchRequest`s into per-partition reads
/// against another broker's in-process `ReplicaManager`. A real deployment
/// implements this trait over the RPC layer instead; this adapter exists so
/// single-process tests (and co-located brokers) can exercise replication
/// without a network hop.
pub struct InProcessLeaderClient {
    leaders: DashMap<BrokerId, Arc<ReplicaManager>>,
}

impl InProcessLeaderClient {
    pub fn new() -> Self {
        Self {
            leaders: DashMap::new(),
        }
    }

    pub fn register(&self, broker_id: BrokerId, manager: Arc<ReplicaManager>) {
        self.leaders.insert(broker_id, manager);
    }
}

impl Default for InProcessLeaderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderClient for InProcessLeaderClient {
    fn fetch(&self, leader: BrokerId, requests: Vec<UpstreamFetchRequest>) -> Vec<UpstreamFetchResponse> {
        let Some(manager) = self.leaders.get(&leader) else {
            return requests
                .into_iter()
                .map(|r| UpstreamFetchResponse {
                    topic_partition: r.topic_partition,
                    high_watermark: 0,
                    records: Vec::new(),
                    error: Some(PartitionError::ReplicaNotAvailable),
                })
                .collect();
        };

        requests
            .into_iter()
            .map(|r| {
                let target = PerPartitionFetchInfo {
                    topic_partition: r.topic_partition.clone(),
                    offset: r.fetch_offset,
                    max_bytes: r.max_bytes,
                };
                let result = read_one_partition(&manager.partitions, &target, FetcherId::Debug);
                UpstreamFetchResponse {
                    topic_partition: r.topic_partition,
                    high_watermark: result.high_watermark,
                    records: result.records,
                    error: result.error,
                }
            })
            .collect()
    }
}

#[allow(dead_code)]
fn _assert_partition_runtime_state_shape(_: PartitionRuntimeState) {}
