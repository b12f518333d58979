use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use crate::options::TrailOptions;
use crate::partition::Partition;

/// Sorted collection of live partitions keyed by partition number.
///
/// Partitions are shared as `Arc` so a reader holding one across a
/// concurrent detach keeps a valid open file; the detached file is only
/// unlinked after the detaching lock is released. Structural mutation
/// (insert, detach) happens under the Write, Compaction or Exclusive lock
/// per the caller's discipline; the inner `RwLock` only protects the map
/// itself.
pub(crate) struct PartitionList {
    inner: RwLock<BTreeMap<u64, Arc<Partition>>>,
    /// Most recently resolved partition; most reads are sequential, so the
    /// hint usually short-circuits the map lookup.
    cursor: Mutex<Option<Arc<Partition>>>,
}

impl PartitionList {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            cursor: Mutex::new(None),
        }
    }

    pub fn insert(&self, partition: Arc<Partition>) {
        self.inner.write().insert(partition.number(), partition);
    }

    /// The partition owning `index`, if present.
    pub fn try_get(&self, options: &TrailOptions, index: u64) -> Option<Arc<Partition>> {
        {
            let cursor = self.cursor.lock();
            if let Some(hint) = cursor.as_ref() {
                if hint.contains(index) {
                    return Some(hint.clone());
                }
            }
        }

        let number = options.partition_number(index);
        let found = self.inner.read().get(&number).cloned()?;
        *self.cursor.lock() = Some(found.clone());
        Some(found)
    }

    /// The partition owning `index`, created lazily if missing. Callers hold
    /// the Write or Exclusive lock.
    pub fn get_or_create(
        &self,
        options: &TrailOptions,
        dir: &Path,
        index: u64,
    ) -> Result<Arc<Partition>> {
        if let Some(found) = self.try_get(options, index) {
            return Ok(found);
        }

        let number = options.partition_number(index);
        let path = options.partition_path(dir, number);
        let created = Arc::new(Partition::create(path, number, options)?);
        self.inner.write().insert(number, created.clone());
        *self.cursor.lock() = Some(created.clone());
        Ok(created)
    }

    /// Unlink and return the head partitions fully covered by
    /// `snapshot_index`. File deletion is the caller's job, after its lock
    /// is released.
    pub fn detach_covered(&self, snapshot_index: u64) -> Vec<Arc<Partition>> {
        let mut map = self.inner.write();
        let covered: Vec<u64> = map
            .values()
            .take_while(|p| p.last_index() <= snapshot_index)
            .map(|p| p.number())
            .collect();
        let detached: Vec<Arc<Partition>> = covered
            .into_iter()
            .filter_map(|number| map.remove(&number))
            .collect();
        if !detached.is_empty() {
            *self.cursor.lock() = None;
        }
        detached
    }

    /// Unlink and return the tail partitions whose whole range lies at or
    /// above `index`. Used by tail rewrites that shrink the log.
    pub fn detach_from(&self, index: u64) -> Vec<Arc<Partition>> {
        let mut map = self.inner.write();
        let orphaned: Vec<u64> = map
            .values()
            .rev()
            .take_while(|p| p.first_index() >= index)
            .map(|p| p.number())
            .collect();
        let detached: Vec<Arc<Partition>> = orphaned
            .into_iter()
            .filter_map(|number| map.remove(&number))
            .collect();
        if !detached.is_empty() {
            *self.cursor.lock() = None;
        }
        detached
    }

    pub fn first(&self) -> Option<Arc<Partition>> {
        self.inner.read().values().next().cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.inner.read().values().map(|p| p.bytes_on_disk()).sum()
    }

    pub fn cached_entries(&self) -> usize {
        self.inner.read().values().map(|p| p.cached_entries()).sum()
    }

    pub fn for_each<F: FnMut(&Arc<Partition>)>(&self, mut f: F) {
        for partition in self.inner.read().values() {
            f(partition);
        }
    }
}
