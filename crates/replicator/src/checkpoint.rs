//! Persists per-partition high watermarks to a file per data directory. A
//! broker that cannot durably record its HW must not keep serving, so every
//! I/O failure here is reported as a [`StorageFailure`] for the caller to
//! treat as fatal rather than retried or swallowed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use replicator_storage::PartitionId;

use crate::error::StorageFailure;
use crate::types::TopicPartition;

const CHECKPOINT_FILE_NAME: &str = "replication-offset-checkpoint";
const SCHEMA_VERSION: u32 = 0;

/// One data directory's high-watermark checkpoint file.
///
/// Writes go to a temp file in the same directory followed by a rename, so a
/// crash mid-write never leaves a partially-written checkpoint in place.
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageFailure> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| StorageFailure {
            context: format!("create data directory {}", data_dir.display()),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path: data_dir.join(CHECKPOINT_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `{topicPartition -> HW}` for every local replica in this
    /// directory. Two back-to-back calls with the same input produce
    /// byte-identical files: entries are sorted for a deterministic order.
    pub fn write(&self, entries: &HashMap<TopicPartition, u64>) -> Result<(), StorageFailure> {
        let mut sorted: Vec<(&TopicPartition, &u64)> = entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut content = format!("{SCHEMA_VERSION}\n{}\n", sorted.len());
        for (tp, hw) in &sorted {
            content.push_str(&format!("{} {} {}\n", tp.topic, tp.partition.as_u32(), hw));
        }

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(|e| StorageFailure {
            context: format!("write checkpoint temp file {}", tmp_path.display()),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StorageFailure {
            context: format!("rename checkpoint file into place at {}", self.path.display()),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Read back the checkpointed HW per partition. Returns an empty map if no
    /// checkpoint has ever been written for this directory.
    pub fn read(&self) -> Result<HashMap<TopicPartition, u64>, StorageFailure> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| StorageFailure {
            context: format!("read checkpoint file {}", self.path.display()),
            reason: e.to_string(),
        })?;
        parse_checkpoint(&content).map_err(|reason| StorageFailure {
            context: format!("parse checkpoint file {}", self.path.display()),
            reason,
        })
    }
}

fn parse_checkpoint(content: &str) -> Result<HashMap<TopicPartition, u64>, String> {
    let mut lines = content.lines();
    let _version: u32 = lines
        .next()
        .ok_or("missing schema version line")?
        .trim()
        .parse()
        .map_err(|_| "schema version line is not an integer".to_string())?;
    let count: usize = lines
        .next()
        .ok_or("missing entry count line")?
        .trim()
        .parse()
        .map_err(|_| "entry count line is not an integer".to_string())?;

    let mut entries = HashMap::with_capacity(count);
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split(' ');
        let topic = parts.next().ok_or("missing topic field")?.to_string();
        let partition: u32 = parts
            .next()
            .ok_or("missing partition field")?
            .parse()
            .map_err(|_| "partition field is not an integer".to_string())?;
        let hw: u64 = parts
            .next()
            .ok_or("missing high watermark field")?
            .parse()
            .map_err(|_| "high watermark field is not an integer".to_string())?;
        entries.insert(TopicPartition::new(topic, PartitionId::new(partition)), hw);
    }
    if entries.len() != count {
        return Err(format!(
            "entry count header said {count} but found {}",
            entries.len()
        ));
    }
    Ok(entries)
}

/// Dispatches checkpoint writes to the right per-data-directory file. This
/// broker hosts a single data directory today (see `ReplicaManagerConfig`),
/// but the store is keyed by path so a multi-directory broker can reuse it
/// unchanged.
#[derive(Default)]
pub struct CheckpointStore {
    files: parking_lot::Mutex<HashMap<PathBuf, CheckpointFile>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(
        &self,
        data_dir: &Path,
        entries: &HashMap<TopicPartition, u64>,
    ) -> Result<(), StorageFailure> {
        let mut files = self.files.lock();
        let file = match files.get(data_dir) {
            Some(file) => file,
            None => {
                let file = CheckpointFile::new(data_dir.to_path_buf())?;
                files.entry(data_dir.to_path_buf()).or_insert(file)
            }
        };
        file.write(entries)
    }

    pub fn read(&self, data_dir: &Path) -> Result<HashMap<TopicPartition, u64>, StorageFailure> {
        let mut files = self.files.lock();
        let file = match files.get(data_dir) {
            Some(file) => file,
            None => {
                let file = CheckpointFile::new(data_dir.to_path_buf())?;
                files.entry(data_dir.to_path_buf()).or_insert(file)
            }
        };
        file.read()
    }
}
