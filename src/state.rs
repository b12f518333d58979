use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

pub(crate) const STATE_FILE: &str = "node.state";

/// term (8) + vote uuid (16) + commit index (8) + last applied (8) + last index (8).
const STATE_RECORD_SIZE: usize = 48;

/// In-memory view of the persisted node state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateView {
    pub term: u64,
    /// Candidate voted for in `term`; the all-zero uuid encodes "no vote".
    pub last_vote: Option<Uuid>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
}

impl StateView {
    /// Next writable index.
    pub fn tail_index(&self) -> u64 {
        self.last_index + 1
    }

    fn encode(&self) -> [u8; STATE_RECORD_SIZE] {
        let mut buf = [0u8; STATE_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8..24].copy_from_slice(self.last_vote.unwrap_or(Uuid::nil()).as_bytes());
        buf[24..32].copy_from_slice(&self.commit_index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_applied.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_index.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < STATE_RECORD_SIZE {
            return Err(anyhow!(
                "node state record requires {} bytes, got {}",
                STATE_RECORD_SIZE,
                data.len()
            ));
        }
        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&data[0..8]);
        let term = u64::from_le_bytes(u64_bytes);

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&data[8..24]);
        let vote = Uuid::from_bytes(uuid_bytes);

        u64_bytes.copy_from_slice(&data[24..32]);
        let commit_index = u64::from_le_bytes(u64_bytes);
        u64_bytes.copy_from_slice(&data[32..40]);
        let last_applied = u64::from_le_bytes(u64_bytes);
        u64_bytes.copy_from_slice(&data[40..48]);
        let last_index = u64::from_le_bytes(u64_bytes);

        Ok(Self {
            term,
            last_vote: (!vote.is_nil()).then_some(vote),
            commit_index,
            last_applied,
            last_index,
        })
    }
}

/// The persisted node state record (`node.state`), flushed on every change,
/// plus a watch channel publishing each new view to commit waiters.
pub(crate) struct NodeState {
    file: File,
    view: RwLock<StateView>,
    publisher: watch::Sender<StateView>,
}

impl NodeState {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open node state file {:?}", path))?;

        let len = file.metadata()?.len();
        let view = if len == 0 {
            StateView::default()
        } else {
            let mut buf = [0u8; STATE_RECORD_SIZE];
            file.read_exact_at(&mut buf, 0)
                .with_context(|| format!("read node state record {:?}", path))?;
            StateView::decode(&buf)?
        };

        if view.commit_index > view.last_index || view.last_applied > view.commit_index {
            warn!(
                commit = view.commit_index,
                applied = view.last_applied,
                last = view.last_index,
                "inconsistent node state record"
            );
            return Err(anyhow!("inconsistent node state record in {:?}", path));
        }

        let (publisher, _) = watch::channel(view);
        Ok(Self {
            file,
            view: RwLock::new(view),
            publisher,
        })
    }

    pub fn view(&self) -> StateView {
        *self.view.read()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateView> {
        self.publisher.subscribe()
    }

    /// Mutate the record, persist it, and publish the new view. The caller
    /// must hold the lock mode matching the fields it touches (Write for
    /// append-time fields, Exclusive for commit/apply fields).
    pub fn update<F>(&self, mutate: F) -> Result<StateView>
    where
        F: FnOnce(&mut StateView),
    {
        let next = {
            let mut view = self.view.write();
            mutate(&mut view);
            *view
        };
        self.file.write_all_at(&next.encode(), 0)?;
        self.file.sync_data()?;
        self.publisher.send_replace(next);
        Ok(next)
    }
}
