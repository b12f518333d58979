//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use raft_trail::{AuditTrail, LogEntry, SnapshotBuilder, StateMachine, TrailOptions};

/// State machine that journals every applied payload. Snapshot entries reset
/// the journal to the folded state they carry, so re-application from a
/// clean slate converges on the same contents.
pub struct JournalMachine {
    pub applied: Mutex<Vec<Vec<u8>>>,
    pub snapshots_restored: Mutex<Vec<Vec<u8>>>,
}

impl JournalMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
            snapshots_restored: Mutex::new(Vec::new()),
        })
    }

    pub fn applied_payloads(&self) -> Vec<Vec<u8>> {
        self.applied.lock().clone()
    }

    /// The machine's logical state: the folded snapshot prefix plus every
    /// payload applied after it, concatenated.
    pub fn contents(&self) -> Vec<u8> {
        self.applied.lock().concat()
    }
}

#[async_trait]
impl StateMachine for JournalMachine {
    async fn apply(&self, _index: u64, entry: &LogEntry) -> Result<()> {
        if entry.is_snapshot() {
            self.snapshots_restored.lock().push(entry.payload.clone());
            *self.applied.lock() = vec![entry.payload.clone()];
        } else {
            self.applied.lock().push(entry.payload.clone());
        }
        Ok(())
    }

    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder> {
        Box::new(ConcatBuilder { folded: Vec::new() })
    }
}

/// Folds entries by concatenating their payloads; the existing snapshot
/// entry, when present, seeds the folded state.
pub struct ConcatBuilder {
    folded: Vec<u8>,
}

#[async_trait]
impl SnapshotBuilder for ConcatBuilder {
    async fn apply(&mut self, _index: u64, entry: &LogEntry) -> Result<()> {
        if entry.is_snapshot() {
            self.folded = entry.payload.clone();
        } else {
            self.folded.extend_from_slice(&entry.payload);
        }
        Ok(())
    }

    fn write_to(&self, writer: &mut dyn std::io::Write) -> Result<()> {
        writer.write_all(&self.folded)?;
        Ok(())
    }
}

pub fn small_options() -> TrailOptions {
    TrailOptions {
        records_per_partition: 4,
        ..Default::default()
    }
}

pub async fn open_trail(dir: &std::path::Path, machine: Arc<JournalMachine>) -> AuditTrail {
    AuditTrail::open(dir, small_options(), machine).await.unwrap()
}

pub fn entry(term: u64, payload: &str) -> LogEntry {
    LogEntry::new(term, payload.as_bytes().to_vec())
}
