//! Replica manager core for a leader/follower replication cluster.
//!
//! This crate owns the set of topic-partitions hosted locally, routes produce
//! and fetch requests to each partition's leader replica, coordinates
//! leader/follower role transitions on command from the cluster controller,
//! maintains the in-sync replica set for every partition it leads, advances
//! and checkpoints the high watermark, and implements the delayed/purgatory
//! semantics that let produce and fetch calls wait for a quorum instead of
//! blocking a request thread.
//!
//! The on-disk segmented log engine ([`replicator_storage`]), the
//! coordination store that records controller epoch and ISR changes
//! ([`replicator_cluster`]), the controller that issues leader/follower
//! commands, and the socket/RPC layer are all external collaborators this
//! crate only ever reaches through narrow trait boundaries.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod partition;
pub mod purgatory;
pub mod replica;
pub mod types;

pub use checkpoint::{CheckpointFile, CheckpointStore};
pub use config::ReplicaManagerConfig;
pub use error::{PartitionError, RequestError, StorageFailure};
pub use fetcher::{FetchRequest, FetchResponse as UpstreamFetchResponse, FetchTarget, FetcherManager, LeaderClient};
pub use manager::{
    ControllerResponse, FetchCallback, FetchPartitionResult, InProcessLeaderClient, LeadershipChange,
    PartitionState, PerPartitionFetchInfo, ProduceCallback, ProducePartitionResult, ReplicaManager,
};
pub use manager::{FetchResponse, ProduceResponse};
pub use partition::{AppendInfo, FetchInfo, FollowerUpdateOutcome, Partition, PartitionMode};
pub use purgatory::{DelayedOperation, Purgatory};
pub use replica::Replica;
pub use types::{BrokerId, Epoch, FetcherId, RequiredAcks, TopicPartition};

pub use log::{debug, error, info, trace, warn};
