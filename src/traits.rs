use anyhow::Result;
use async_trait::async_trait;

use crate::entry::LogEntry;

/// The external state machine fed by the commit pipeline.
///
/// `apply` is invoked once per newly-committed index in increasing order.
/// Across a crash the same entries may be re-applied from the snapshot and
/// the committed suffix (`replay`), so implementations must be idempotent
/// with respect to re-application from a clean state. An entry with
/// `is_snapshot()` set asks the machine to reset itself to the folded state
/// the payload carries.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: u64, entry: &LogEntry) -> Result<()>;

    /// A fresh builder for the next snapshot. The trail feeds it the current
    /// snapshot entry (if any) followed by every committed entry being
    /// folded, then serializes it.
    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder>;
}

/// Accumulates log entries into the payload of the next snapshot.
#[async_trait]
pub trait SnapshotBuilder: Send {
    /// Fold one entry into the builder state. The first call may carry the
    /// existing snapshot entry.
    async fn apply(&mut self, index: u64, entry: &LogEntry) -> Result<()>;

    /// Advise the next index to fold, given the iteration bounds and the
    /// default cursor. Builders that can prove a range is irrelevant skip it
    /// by returning a larger cursor; the iteration clamps the advice to
    /// `[cursor, end + 1]`.
    fn adjust_index(&self, _start: u64, _end: u64, cursor: u64) -> u64 {
        cursor
    }

    /// Serialize the accumulated state into the snapshot payload.
    fn write_to(&self, writer: &mut dyn std::io::Write) -> Result<()>;
}
