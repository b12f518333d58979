use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::warn;

use crate::entry::{EntryMeta, LogEntry, ENTRY_METADATA_SIZE};
use crate::options::TrailOptions;

/// One partition file: an offset-table header of `R` u64 slots followed by
/// `[metadata][payload]` records appended at the tail. The file is named by
/// its decimal partition number and owns indices
/// `[number * R, number * R + R - 1]`.
///
/// Appends write the record at the tail first and publish the slot offset
/// afterwards (release store in memory, then the on-disk header slot), so a
/// concurrent weak reader sees either the complete entry or an empty slot,
/// never a torn record. Offset 0 means the slot was never written.
pub(crate) struct Partition {
    number: u64,
    path: PathBuf,
    file: File,
    records: u64,
    header_size: u64,
    offsets: Box<[AtomicU64]>,
    tail: AtomicU64,
    /// Cached payloads of uncommitted entries, one slot per record.
    cache: Mutex<Box<[Option<LogEntry>]>>,
    sync_on_write: bool,
}

impl Partition {
    /// Create a fresh partition file with a zeroed header.
    pub fn create(path: PathBuf, number: u64, options: &TrailOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create partition file {:?}", path))?;

        let header_size = options.partition_header_size();
        file.write_all_at(&vec![0u8; header_size as usize], 0)?;
        if options.initial_partition_size > header_size {
            file.set_len(options.initial_partition_size)?;
        }

        Ok(Self {
            number,
            path,
            file,
            records: options.records_per_partition,
            header_size,
            offsets: make_offsets(options.records_per_partition),
            tail: AtomicU64::new(header_size),
            cache: Mutex::new(make_cache(options.records_per_partition)),
            sync_on_write: options.write_through,
        })
    }

    /// Open an existing partition file, rebuilding the in-memory offset
    /// table from the on-disk header and recovering the append tail from the
    /// slot records. A slot pointing at an unreadable record is zeroed and
    /// skipped rather than failing the whole partition.
    pub fn open(path: PathBuf, number: u64, options: &TrailOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open partition file {:?}", path))?;

        let header_size = options.partition_header_size();
        let file_len = file.metadata()?.len();
        if file_len < header_size {
            return Err(anyhow!(
                "partition file {:?} shorter than its {}-byte header",
                path,
                header_size
            ));
        }

        let mut header = vec![0u8; header_size as usize];
        file.read_exact_at(&mut header, 0)?;

        let records = options.records_per_partition;
        let offsets = make_offsets(records);
        let mut tail = header_size;
        let mut meta_buf = [0u8; ENTRY_METADATA_SIZE];

        for slot in 0..records as usize {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[slot * 8..slot * 8 + 8]);
            let offset = u64::from_le_bytes(raw);
            if offset == 0 {
                continue;
            }

            let end = (|| -> Result<u64> {
                file.read_exact_at(&mut meta_buf, offset)?;
                let meta = EntryMeta::decode(&meta_buf)?;
                let end = offset + ENTRY_METADATA_SIZE as u64 + meta.length;
                if end > file_len {
                    return Err(anyhow!("record extends past end of file"));
                }
                Ok(end)
            })();

            match end {
                Ok(end) => {
                    offsets[slot].store(offset, Ordering::Relaxed);
                    tail = tail.max(end);
                }
                Err(err) => {
                    warn!(
                        partition = number,
                        slot,
                        offset,
                        "dropping unreadable slot during recovery: {err}"
                    );
                    file.write_all_at(&0u64.to_le_bytes(), slot as u64 * 8)?;
                }
            }
        }

        Ok(Self {
            number,
            path,
            file,
            records,
            header_size,
            offsets,
            tail: AtomicU64::new(tail),
            cache: Mutex::new(make_cache(records)),
            sync_on_write: options.write_through,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// First index owned by this partition.
    pub fn first_index(&self) -> u64 {
        self.number * self.records
    }

    /// Last index owned by this partition.
    pub fn last_index(&self) -> u64 {
        self.first_index() + self.records - 1
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.first_index() && index <= self.last_index()
    }

    fn slot(&self, index: u64) -> usize {
        debug_assert!(self.contains(index));
        (index - self.first_index()) as usize
    }

    pub fn is_written(&self, index: u64) -> bool {
        self.offsets[self.slot(index)].load(Ordering::Acquire) != 0
    }

    /// Append `entry` for `index` at the file tail and repoint the slot.
    /// Overwriting a previously written slot leaves the old record as dead
    /// space until the partition is dropped. Does not flush.
    pub fn write(
        &self,
        entry: &LogEntry,
        index: u64,
        scratch: &mut Vec<u8>,
        cache: bool,
    ) -> Result<()> {
        let slot = self.slot(index);
        let position = self.tail.load(Ordering::Relaxed);

        scratch.clear();
        scratch.extend_from_slice(&entry.meta().encode());
        scratch.extend_from_slice(&entry.payload);
        self.file.write_all_at(scratch, position)?;
        self.file
            .write_all_at(&position.to_le_bytes(), slot as u64 * 8)?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }

        self.offsets[slot].store(position, Ordering::Release);
        self.tail
            .store(position + scratch.len() as u64, Ordering::Relaxed);

        let mut cached = self.cache.lock();
        cached[slot] = cache.then(|| entry.clone());
        Ok(())
    }

    /// Read the entry at `index`, preferring the cached copy. Returns
    /// `None` for a slot that was never written.
    pub fn read(&self, index: u64, scratch: &mut Vec<u8>) -> Result<Option<LogEntry>> {
        let slot = self.slot(index);

        if let Some(entry) = self.cache.lock()[slot].clone() {
            return Ok(Some(entry));
        }

        let offset = self.offsets[slot].load(Ordering::Acquire);
        if offset == 0 {
            return Ok(None);
        }

        scratch.clear();
        scratch.resize(ENTRY_METADATA_SIZE, 0);
        self.file.read_exact_at(scratch, offset)?;
        let meta = EntryMeta::decode(scratch)?;

        let mut payload = vec![0u8; meta.length as usize];
        self.file
            .read_exact_at(&mut payload, offset + ENTRY_METADATA_SIZE as u64)?;
        Ok(Some(LogEntry::from_parts(meta, payload)))
    }

    /// Read only the metadata record for `index`.
    pub fn read_meta(&self, index: u64) -> Result<Option<EntryMeta>> {
        let slot = self.slot(index);
        if let Some(entry) = self.cache.lock()[slot].as_ref() {
            return Ok(Some(entry.meta()));
        }
        let offset = self.offsets[slot].load(Ordering::Acquire);
        if offset == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; ENTRY_METADATA_SIZE];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(Some(EntryMeta::decode(&buf)?))
    }

    pub fn flush(&self) -> Result<()> {
        if !self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Zero the slot for `index` in memory and on disk. Used when a tail
    /// rewrite orphans previously written indices.
    pub fn clear_slot(&self, index: u64) -> Result<()> {
        let slot = self.slot(index);
        self.offsets[slot].store(0, Ordering::Release);
        self.file.write_all_at(&0u64.to_le_bytes(), slot as u64 * 8)?;
        self.cache.lock()[slot] = None;
        Ok(())
    }

    /// Drop cached payloads for all indices up to and including `index`.
    pub fn evict_cached_up_to(&self, index: u64) {
        let mut cached = self.cache.lock();
        let last = index.min(self.last_index());
        if last < self.first_index() {
            return;
        }
        for slot in 0..=self.slot(last) {
            cached[slot] = None;
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().iter().filter(|c| c.is_some()).count()
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    /// Delete the backing file. Callers invoke this only after the lock that
    /// detached the partition has been released; in-flight readers keep
    /// their open descriptor.
    pub fn delete(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(partition = self.number, "failed to delete partition file: {err}");
        }
    }
}

fn make_offsets(records: u64) -> Box<[AtomicU64]> {
    (0..records).map(|_| AtomicU64::new(0)).collect()
}

fn make_cache(records: u64) -> Box<[Option<LogEntry>]> {
    (0..records).map(|_| None).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> TrailOptions {
        TrailOptions {
            records_per_partition: 4,
            ..Default::default()
        }
    }

    fn entry(term: u64, payload: &[u8]) -> LogEntry {
        LogEntry::new(term, payload.to_vec())
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let options = options();
        let partition =
            Partition::create(dir.path().join("0"), 0, &options).unwrap();
        let mut scratch = Vec::new();

        partition.write(&entry(1, b"a"), 1, &mut scratch, false).unwrap();
        partition.write(&entry(1, b"b"), 2, &mut scratch, false).unwrap();

        let read = partition.read(1, &mut scratch).unwrap().unwrap();
        assert_eq!(read.term, 1);
        assert_eq!(read.payload, b"a");

        assert!(partition.read(3, &mut scratch).unwrap().is_none());
        assert!(!partition.is_written(0));
        assert!(partition.is_written(2));
    }

    #[test]
    fn test_overwrite_repoints_slot() {
        let dir = TempDir::new().unwrap();
        let partition =
            Partition::create(dir.path().join("0"), 0, &options()).unwrap();
        let mut scratch = Vec::new();

        partition.write(&entry(1, b"old"), 2, &mut scratch, false).unwrap();
        let tail_before = partition.bytes_on_disk();
        partition.write(&entry(3, b"new"), 2, &mut scratch, false).unwrap();

        // The file grew; the old record is dead space.
        assert!(partition.bytes_on_disk() > tail_before);
        let read = partition.read(2, &mut scratch).unwrap().unwrap();
        assert_eq!(read.term, 3);
        assert_eq!(read.payload, b"new");
    }

    #[test]
    fn test_recovery_rebuilds_offsets_and_tail() {
        let dir = TempDir::new().unwrap();
        let options = options();
        let path = dir.path().join("1");
        let tail;
        {
            let partition = Partition::create(path.clone(), 1, &options).unwrap();
            let mut scratch = Vec::new();
            partition.write(&entry(2, b"four"), 4, &mut scratch, false).unwrap();
            partition.write(&entry(2, b"six"), 6, &mut scratch, false).unwrap();
            partition.flush().unwrap();
            tail = partition.bytes_on_disk();
        }

        let partition = Partition::open(path, 1, &options).unwrap();
        assert_eq!(partition.bytes_on_disk(), tail);
        let mut scratch = Vec::new();
        assert_eq!(
            partition.read(4, &mut scratch).unwrap().unwrap().payload,
            b"four"
        );
        assert!(partition.read(5, &mut scratch).unwrap().is_none());
        assert_eq!(
            partition.read(6, &mut scratch).unwrap().unwrap().payload,
            b"six"
        );
    }

    #[test]
    fn test_cached_entry_served_without_disk() {
        let dir = TempDir::new().unwrap();
        let partition =
            Partition::create(dir.path().join("0"), 0, &options()).unwrap();
        let mut scratch = Vec::new();

        partition.write(&entry(1, b"cached"), 1, &mut scratch, true).unwrap();
        assert_eq!(partition.cached_entries(), 1);

        let read = partition.read(1, &mut scratch).unwrap().unwrap();
        assert_eq!(read.payload, b"cached");

        partition.evict_cached_up_to(1);
        assert_eq!(partition.cached_entries(), 0);

        // Still readable from disk after eviction.
        let read = partition.read(1, &mut scratch).unwrap().unwrap();
        assert_eq!(read.payload, b"cached");
    }

    #[test]
    fn test_clear_slot_persists() {
        let dir = TempDir::new().unwrap();
        let options = options();
        let path = dir.path().join("0");
        {
            let partition = Partition::create(path.clone(), 0, &options).unwrap();
            let mut scratch = Vec::new();
            partition.write(&entry(1, b"a"), 1, &mut scratch, false).unwrap();
            partition.write(&entry(1, b"b"), 2, &mut scratch, false).unwrap();
            partition.clear_slot(2).unwrap();
            partition.flush().unwrap();
        }

        let partition = Partition::open(path, 0, &options).unwrap();
        let mut scratch = Vec::new();
        assert!(partition.read(1, &mut scratch).unwrap().is_some());
        assert!(partition.read(2, &mut scratch).unwrap().is_none());
    }

    #[test]
    fn test_preallocation_does_not_confuse_recovery() {
        let dir = TempDir::new().unwrap();
        let options = TrailOptions {
            records_per_partition: 4,
            initial_partition_size: 4096,
            ..Default::default()
        };
        let path = dir.path().join("0");
        {
            let partition = Partition::create(path.clone(), 0, &options).unwrap();
            let mut scratch = Vec::new();
            partition.write(&entry(1, b"x"), 0, &mut scratch, false).unwrap();
            partition.flush().unwrap();
        }
        let partition = Partition::open(path, 0, &options).unwrap();
        let mut scratch = Vec::new();
        assert_eq!(partition.read(0, &mut scratch).unwrap().unwrap().payload, b"x");
    }
}
