use std::sync::Arc;

use thiserror::Error;

pub type TrailResult<T> = Result<T, TrailError>;

/// Errors surfaced by the audit trail.
///
/// Everything here is recoverable for the caller except `MissingPartition`,
/// which indicates on-disk state corruption: a committed index has no owning
/// partition file. Snapshot rename failures never reach this enum at all;
/// that single code path aborts the process instead.
#[derive(Debug, Clone, Error)]
pub enum TrailError {
    #[error("index {index} outside the valid range [{first}, {last}]")]
    InvalidIndex { index: u64, first: u64, last: u64 },

    #[error("append at index {index} would overwrite committed history (commit index {commit_index})")]
    InvalidAppend { index: u64, commit_index: u64 },

    #[error("snapshot entries are only accepted through install_snapshot")]
    SnapshotEntryRejected,

    #[error("no partition owns committed index {0}")]
    MissingPartition(u64),

    #[error("read range of {0} entries exceeds the supported maximum")]
    RangeTooBig(u64),

    #[error("audit trail is closed")]
    Disposed,

    #[error("invalid options: {0}")]
    Options(Arc<anyhow::Error>),

    #[error("state machine error: {0}")]
    Apply(Arc<anyhow::Error>),

    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),
}

impl TrailError {
    pub(crate) fn io(err: impl Into<anyhow::Error>) -> Self {
        TrailError::Io(Arc::new(err.into()))
    }

    pub(crate) fn apply(err: impl Into<anyhow::Error>) -> Self {
        TrailError::Apply(Arc::new(err.into()))
    }

    /// True when the error means the on-disk state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrailError::MissingPartition(_))
    }
}
