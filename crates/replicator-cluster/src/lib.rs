//! Coordination-store client for the replica manager.
//!
//! This crate models the external coordination store (a ZooKeeper-shaped
//! store in the original broker) that records, per partition, the current
//! leader, leader epoch, and in-sync replica set. The replica manager treats
//! it as a shared external resource: writes use compare-and-swap on the
//! leader epoch to detect a conflicting controller, and the replica manager
//! never blocks log I/O on it.

pub mod error;
pub mod manifest;
pub mod metadata_store;
pub mod types;

pub use error::ClusterError;

// Re-export commonly used metadata store types for ergonomics
pub use metadata_store::{FileMetadataStore, InMemoryMetadataStore, MetadataBackend, MetadataStore};

// Re-export logging macros for consistent usage across the crate
pub use log::{debug, error, info, trace, warn};
