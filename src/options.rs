use std::path::Path;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::entry::ENTRY_METADATA_SIZE;

/// When the commit pipeline builds snapshots and detaches covered partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    /// Build the snapshot synchronously inside `commit`, under the exclusive
    /// lock, whenever at least one whole partition of committed entries has
    /// accumulated.
    Sequential,
    /// Build the snapshot in parallel with applying newly-committed entries,
    /// both inside the same exclusive section.
    Foreground,
    /// `commit` never compacts; the embedder calls `force_compaction`, which
    /// builds under a weak-read lock and installs under the compaction lock.
    Background,
}

/// When cached payloads of appended entries are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEviction {
    /// Drop the cached copy as soon as the entry has been applied.
    OnCommit,
    /// Keep the cached copy until the owning partition next flushes.
    OnFlush,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailOptions {
    /// Entries per partition file (`R`). Must be at least 2.
    pub records_per_partition: u64,
    /// Initial capacity of each reader/writer session buffer.
    pub buffer_size: usize,
    /// Initial capacity of the compaction session buffer.
    pub snapshot_buffer_size: usize,
    /// Pre-allocation hint for new partition files, in bytes. 0 disables.
    pub initial_partition_size: u64,
    /// Reader session pool size.
    pub max_concurrent_reads: usize,
    /// Sync partition and snapshot writes eagerly, making `flush` a no-op
    /// barrier.
    pub write_through: bool,
    pub compaction_mode: CompactionMode,
    pub cache_eviction: CacheEviction,
    /// Reapply the snapshot plus all committed entries to the state machine
    /// when the trail is opened.
    pub replay_on_initialize: bool,
}

impl Default for TrailOptions {
    fn default() -> Self {
        Self {
            records_per_partition: 512,
            buffer_size: 8 * 1024,
            snapshot_buffer_size: 64 * 1024,
            initial_partition_size: 0,
            max_concurrent_reads: 4,
            write_through: false,
            compaction_mode: CompactionMode::Sequential,
            cache_eviction: CacheEviction::OnCommit,
            replay_on_initialize: false,
        }
    }
}

impl TrailOptions {
    pub fn validate(&self) -> Result<()> {
        if self.records_per_partition < 2 {
            bail!(
                "records_per_partition must be at least 2, got {}",
                self.records_per_partition
            );
        }
        if self.buffer_size < ENTRY_METADATA_SIZE {
            bail!(
                "buffer_size must hold at least one {}-byte metadata record",
                ENTRY_METADATA_SIZE
            );
        }
        if self.max_concurrent_reads == 0 {
            bail!("max_concurrent_reads must be at least 1");
        }
        Ok(())
    }

    /// Size of a partition file's offset-table header.
    pub(crate) fn partition_header_size(&self) -> u64 {
        self.records_per_partition * 8
    }

    /// Number of the partition owning `index`.
    pub(crate) fn partition_number(&self, index: u64) -> u64 {
        index / self.records_per_partition
    }

    pub(crate) fn partition_path(&self, dir: &Path, number: u64) -> std::path::PathBuf {
        dir.join(number.to_string())
    }
}
