use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{error, warn};

use crate::entry::{EntryMeta, LogEntry, ENTRY_METADATA_SIZE};

pub(crate) const SNAPSHOT_FILE: &str = "snapshot";
pub(crate) const SNAPSHOT_TEMP_FILE: &str = "snapshot.new";

/// Offset of the metadata record, right after the u64 snapshot index.
const META_OFFSET: u64 = 8;
const PAYLOAD_OFFSET: u64 = META_OFFSET + ENTRY_METADATA_SIZE as u64;

/// The single snapshot file: `[snapshot_index u64][metadata][payload]`.
///
/// Replacement is a write to `snapshot.new` followed by a rename over the
/// canonical file. The index field is written last, so a crash mid-write
/// leaves a temp file that fails validation and is discarded on the next
/// open. A failed rename aborts the process: with the canonical file
/// possibly half-replaced, neither rollback nor forward progress is safe.
pub(crate) struct SnapshotFile {
    file: File,
    index: u64,
    meta: EntryMeta,
}

impl SnapshotFile {
    /// Open the canonical snapshot if one exists. A missing, empty or
    /// zero-index file means "no snapshot".
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SNAPSHOT_FILE);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("open snapshot {:?}", path)),
        };

        let len = file.metadata()?.len();
        if len < PAYLOAD_OFFSET {
            if len > 0 {
                warn!("snapshot file {:?} too short ({len} bytes), ignoring", path);
            }
            return Ok(None);
        }

        let mut index_bytes = [0u8; 8];
        file.read_exact_at(&mut index_bytes, 0)?;
        let index = u64::from_le_bytes(index_bytes);
        if index == 0 {
            return Ok(None);
        }

        let mut meta_bytes = [0u8; ENTRY_METADATA_SIZE];
        file.read_exact_at(&mut meta_bytes, META_OFFSET)?;
        let meta = EntryMeta::decode(&meta_bytes)?;
        if !meta.is_snapshot {
            return Err(anyhow!("snapshot file {:?} holds a non-snapshot entry", path));
        }
        if PAYLOAD_OFFSET + meta.length > len {
            return Err(anyhow!("snapshot file {:?} truncated", path));
        }

        Ok(Some(Self { file, index, meta }))
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn meta(&self) -> EntryMeta {
        self.meta
    }

    /// Materialize the snapshot entry, streaming the payload through
    /// `scratch`.
    pub fn read(&self, scratch: &mut Vec<u8>) -> Result<LogEntry> {
        let chunk = scratch.capacity().max(4096);
        scratch.clear();
        scratch.resize(chunk, 0);

        let mut payload = Vec::with_capacity(self.meta.length as usize);
        let mut position = PAYLOAD_OFFSET;
        let mut remaining = self.meta.length as usize;
        while remaining > 0 {
            let step = chunk.min(remaining);
            self.file.read_exact_at(&mut scratch[..step], position)?;
            payload.extend_from_slice(&scratch[..step]);
            position += step as u64;
            remaining -= step;
        }

        Ok(LogEntry::from_parts(self.meta, payload))
    }

    pub fn bytes_on_disk(&self) -> u64 {
        PAYLOAD_OFFSET + self.meta.length
    }

    /// Stream a snapshot entry to `snapshot.new`. The index footer field is
    /// written after everything else, then the file is synced, so a partial
    /// temp file is always detectable.
    pub fn write_temp(
        dir: &Path,
        entry: &LogEntry,
        snapshot_index: u64,
        chunk_size: usize,
    ) -> Result<PathBuf> {
        debug_assert!(entry.is_snapshot());
        let path = dir.join(SNAPSHOT_TEMP_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create snapshot temp {:?}", path))?;

        file.write_all_at(&entry.meta().encode(), META_OFFSET)?;

        let chunk = chunk_size.max(4096);
        let mut position = PAYLOAD_OFFSET;
        for piece in entry.payload.chunks(chunk) {
            file.write_all_at(piece, position)?;
            position += piece.len() as u64;
        }

        file.write_all_at(&snapshot_index.to_le_bytes(), 0)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Rename `snapshot.new` over the canonical file and reopen it. The
    /// rename is the point of no return; a failure there aborts the
    /// process.
    pub fn install(dir: &Path) -> Result<Self> {
        let temp = dir.join(SNAPSHOT_TEMP_FILE);
        let canonical = dir.join(SNAPSHOT_FILE);
        if let Err(err) = std::fs::rename(&temp, &canonical) {
            error!(
                "failed to swap snapshot {:?} over {:?}: {err}; aborting",
                temp, canonical
            );
            std::process::abort();
        }
        Self::load(dir)?.ok_or_else(|| anyhow!("freshly installed snapshot is empty"))
    }

    /// Remove a leftover temp file from an interrupted install.
    pub fn discard_temp(dir: &Path) {
        match std::fs::remove_file(dir.join(SNAPSHOT_TEMP_FILE)) {
            Ok(()) => warn!("discarded leftover snapshot temp file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to discard snapshot temp file: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_absent_snapshot_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(SnapshotFile::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_write_install_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let entry = LogEntry::snapshot(4, b"folded-state".to_vec());

        SnapshotFile::write_temp(dir.path(), &entry, 9, 4).unwrap();
        let snapshot = SnapshotFile::install(dir.path()).unwrap();
        assert_eq!(snapshot.index(), 9);
        assert_eq!(snapshot.meta().term, 4);

        let mut scratch = Vec::new();
        let read = snapshot.read(&mut scratch).unwrap();
        assert!(read.is_snapshot());
        assert_eq!(read.payload, b"folded-state");

        // Reload from disk sees the same snapshot.
        let reloaded = SnapshotFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.index(), 9);
    }

    #[test]
    fn test_temp_file_is_not_a_snapshot() {
        let dir = TempDir::new().unwrap();
        let entry = LogEntry::snapshot(1, b"s".to_vec());
        SnapshotFile::write_temp(dir.path(), &entry, 3, 1024).unwrap();

        // Canonical file untouched until install.
        assert!(SnapshotFile::load(dir.path()).unwrap().is_none());
        SnapshotFile::discard_temp(dir.path());
        assert!(!dir.path().join(SNAPSHOT_TEMP_FILE).exists());
    }

    #[test]
    fn test_partial_temp_without_footer_rejected_after_rename() {
        let dir = TempDir::new().unwrap();
        // Simulate a crash before the footer write: metadata present but the
        // index field still zero.
        let entry = LogEntry::snapshot(1, b"partial".to_vec());
        let path = SnapshotFile::write_temp(dir.path(), &entry, 5, 1024).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&0u64.to_le_bytes(), 0).unwrap();
        drop(file);

        std::fs::rename(&path, dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert!(SnapshotFile::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_install_is_idempotent_at_same_index() {
        let dir = TempDir::new().unwrap();
        let entry = LogEntry::snapshot(2, b"same".to_vec());

        SnapshotFile::write_temp(dir.path(), &entry, 7, 1024).unwrap();
        SnapshotFile::install(dir.path()).unwrap();
        SnapshotFile::write_temp(dir.path(), &entry, 7, 1024).unwrap();
        let snapshot = SnapshotFile::install(dir.path()).unwrap();

        assert_eq!(snapshot.index(), 7);
        let mut scratch = Vec::new();
        assert_eq!(snapshot.read(&mut scratch).unwrap().payload, b"same");
    }
}
