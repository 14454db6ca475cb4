//! Maintains one background fetch loop per upstream leader broker.
//!
//! The socket/RPC layer that actually serialises a Fetch request onto the
//! wire is out of scope for this crate; callers plug in a [`LeaderClient`]
//! implementation instead. Likewise, applying a fetch response to a local
//! follower replica is delegated to a [`FetchTarget`] so this module never
//! reaches into `ReplicaManager` directly — only the narrow callback that
//! keeps the two sides decoupled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use replicator_storage::RecordWithOffset;

use crate::error::PartitionError;
use crate::types::{BrokerId, TopicPartition};

/// One partition's worth of a Fetch request sent to a leader broker.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub topic_partition: TopicPartition,
    pub fetch_offset: u64,
    pub max_bytes: usize,
}

/// One partition's worth of a Fetch response received from a leader broker.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub topic_partition: TopicPartition,
    pub high_watermark: u64,
    pub records: Vec<RecordWithOffset>,
    pub error: Option<PartitionError>,
}

/// Narrow transport interface: issue a batched Fetch to `leader` and get back
/// one response per requested partition. The real implementation serialises
/// this over whatever RPC mechanism the broker uses; tests and in-process
/// deployments can implement it directly against another broker's
/// `ReplicaManager`.
pub trait LeaderClient: Send + Sync {
    fn fetch(&self, leader: BrokerId, requests: Vec<FetchRequest>) -> Vec<FetchResponse>;
}

/// Narrow callback the fetcher manager uses to apply a fetch response to this
/// broker's local follower replica. Returns the offset to fetch from next, or
/// `None` if the partition should stop being fetched on this loop (no longer
/// a follower of this leader here).
pub trait FetchTarget: Send + Sync {
    fn apply_fetch_response(&self, response: FetchResponse) -> Option<u64>;
}

struct FetcherLoop {
    partitions: Mutex<HashMap<TopicPartition, u64>>,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Default cap on a single partition's Fetch request, mirroring the
/// client-facing `Fetch(... perPartition(offset, maxBytes))` shape.
const DEFAULT_MAX_BYTES_PER_PARTITION: usize = 1024 * 1024;

pub struct FetcherManager {
    client: Arc<dyn LeaderClient>,
    target: Arc<dyn FetchTarget>,
    fetch_interval: Duration,
    loops: Mutex<HashMap<BrokerId, Arc<FetcherLoop>>>,
}

impl FetcherManager {
    pub fn new(
        client: Arc<dyn LeaderClient>,
        target: Arc<dyn FetchTarget>,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            client,
            target,
            fetch_interval,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Register partitions to be fetched from `leader`, starting at the given
    /// offsets. Starts the leader's background loop on first use.
    pub fn add_partitions(&self, leader: BrokerId, partitions: Vec<(TopicPartition, u64)>) {
        let fetcher_loop = self.loop_for(leader);
        let mut map = fetcher_loop.partitions.lock();
        for (tp, offset) in partitions {
            map.insert(tp, offset);
        }
    }

    /// Stop fetching the given partitions, regardless of which leader loop
    /// currently holds them. Used on leadership change and on `StopReplica`.
    pub fn remove_partitions(&self, partitions: &[TopicPartition]) {
        let loops = self.loops.lock();
        for fetcher_loop in loops.values() {
            let mut map = fetcher_loop.partitions.lock();
            for tp in partitions {
                map.remove(tp);
            }
        }
    }

    /// Stop and join any leader loop that no longer has partitions assigned.
    pub fn shutdown_idle_loops(&self) {
        let mut loops = self.loops.lock();
        let idle: Vec<BrokerId> = loops
            .iter()
            .filter(|(_, fetcher_loop)| fetcher_loop.partitions.lock().is_empty())
            .map(|(leader, _)| *leader)
            .collect();

        for leader in idle {
            if let Some(fetcher_loop) = loops.remove(&leader) {
                fetcher_loop.shutdown.store(true, Ordering::SeqCst);
                if let Some(handle) = fetcher_loop.handle.lock().take() {
                    let _ = handle.join();
                }
            }
        }
    }

    pub fn partitions_for(&self, leader: BrokerId) -> Vec<TopicPartition> {
        self.loops
            .lock()
            .get(&leader)
            .map(|l| l.partitions.lock().keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_leaders(&self) -> Vec<BrokerId> {
        self.loops.lock().keys().copied().collect()
    }

    /// Stop every loop unconditionally, used on broker shutdown.
    pub fn shutdown_all(&self) {
        let mut loops = self.loops.lock();
        for (_, fetcher_loop) in loops.drain() {
            fetcher_loop.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = fetcher_loop.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }

    fn loop_for(&self, leader: BrokerId) -> Arc<FetcherLoop> {
        let mut loops = self.loops.lock();
        if let Some(existing) = loops.get(&leader) {
            return Arc::clone(existing);
        }

        let fetcher_loop = Arc::new(FetcherLoop {
            partitions: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let worker_loop = Arc::clone(&fetcher_loop);
        let client = Arc::clone(&self.client);
        let target = Arc::clone(&self.target);
        let interval = self.fetch_interval;
        let handle = thread::spawn(move || run_fetch_loop(leader, worker_loop, client, target, interval));
        *fetcher_loop.handle.lock() = Some(handle);

        loops.insert(leader, Arc::clone(&fetcher_loop));
        fetcher_loop
    }
}

fn run_fetch_loop(
    leader: BrokerId,
    state: Arc<FetcherLoop>,
    client: Arc<dyn LeaderClient>,
    target: Arc<dyn FetchTarget>,
    interval: Duration,
) {
    while !state.shutdown.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let requests: Vec<FetchRequest> = {
            let map = state.partitions.lock();
            map.iter()
                .map(|(tp, offset)| FetchRequest {
                    topic_partition: tp.clone(),
                    fetch_offset: *offset,
                    max_bytes: DEFAULT_MAX_BYTES_PER_PARTITION,
                })
                .collect()
        };
        if requests.is_empty() {
            continue;
        }

        let responses = client.fetch(leader, requests);
        let mut map = state.partitions.lock();
        for response in responses {
            let tp = response.topic_partition.clone();
            match target.apply_fetch_response(response) {
                Some(next_offset) => {
                    map.insert(tp, next_offset);
                }
                None => {
                    map.remove(&tp);
                }
            }
        }
    }
}
