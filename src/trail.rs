use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::LogEntry;
use crate::error::{TrailError, TrailResult};
use crate::event::CommitSignal;
use crate::list::PartitionList;
use crate::lock::LockManager;
use crate::options::{CacheEviction, CompactionMode, TrailOptions};
use crate::partition::Partition;
use crate::session::SessionPool;
use crate::snapshot::SnapshotFile;
use crate::state::{NodeState, StateView};
use crate::traits::StateMachine;

/// Disk usage report for the trail directory.
#[derive(Debug, Clone, Serialize)]
pub struct TrailStats {
    pub partitions: usize,
    pub log_bytes: u64,
    pub snapshot_index: u64,
    pub snapshot_bytes: u64,
    pub cached_entries: usize,
}

/// The persistent audit trail: a partitioned append-only log plus a single
/// snapshot, owned exclusively by one process for its lifetime.
///
/// Appenders serialize on the Write lock, committers and snapshot installs
/// take Exclusive, compaction takes its own mode, and readers share WeakRead
/// sessions that never block the writers.
pub struct AuditTrail {
    dir: PathBuf,
    options: TrailOptions,
    lock: Arc<LockManager>,
    sessions: Arc<SessionPool>,
    partitions: PartitionList,
    snapshot: RwLock<Option<Arc<SnapshotFile>>>,
    state: NodeState,
    /// Term of the entry at `last_index`; volatile, recovered on open.
    last_term: AtomicU64,
    machine: Arc<dyn StateMachine>,
    disposed: AtomicBool,
}

impl AuditTrail {
    /// Open or create the trail in `dir`, recovering partitions, snapshot
    /// and node state from a previous run. A leftover `snapshot.new` from an
    /// interrupted install is discarded; the canonical snapshot always wins.
    pub async fn open(
        dir: impl Into<PathBuf>,
        options: TrailOptions,
        machine: Arc<dyn StateMachine>,
    ) -> TrailResult<Self> {
        options
            .validate()
            .map_err(|e| TrailError::Options(Arc::new(e)))?;

        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(TrailError::io)?;
        SnapshotFile::discard_temp(&dir);

        let state = NodeState::open(&dir).map_err(TrailError::io)?;
        let snapshot = SnapshotFile::load(&dir).map_err(TrailError::io)?;
        let snapshot_index = snapshot.as_ref().map(|s| s.index()).unwrap_or(0);

        // A crash between the snapshot rename and the node-state flush
        // leaves the record behind the snapshot; the snapshot wins.
        let mut view = state.view();
        if snapshot_index > view.commit_index {
            view = state
                .update(|v| {
                    v.commit_index = snapshot_index;
                    v.last_applied = snapshot_index;
                    v.last_index = v.last_index.max(snapshot_index);
                })
                .map_err(TrailError::io)?;
        }

        let partitions = PartitionList::new();
        let mut recovered = 0usize;
        for dir_entry in std::fs::read_dir(&dir).map_err(TrailError::io)? {
            let dir_entry = dir_entry.map_err(TrailError::io)?;
            let name = dir_entry.file_name();
            let Some(number) = name.to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };
            let partition = Partition::open(dir_entry.path(), number, &options)
                .map_err(TrailError::io)?;

            if partition.last_index() <= snapshot_index {
                // Covered by the snapshot; deletion was interrupted.
                info!(partition = number, "removing partition covered by snapshot");
                partition.delete();
            } else if partition.first_index() > view.last_index {
                warn!(partition = number, "removing partition beyond the persisted tail");
                partition.delete();
            } else {
                partitions.insert(Arc::new(partition));
                recovered += 1;
            }
        }

        // A crash between a shrinking rewrite's slot zeroing and the state
        // flush can leave the persisted tail on an empty slot; walk it back
        // to the highest written index. Committed entries must exist.
        let mut last_index = view.last_index;
        while last_index > snapshot_index && last_index > view.commit_index {
            let written = partitions
                .try_get(&options, last_index)
                .map(|p| p.is_written(last_index))
                .unwrap_or(false);
            if written {
                break;
            }
            last_index -= 1;
        }
        if last_index != view.last_index {
            warn!(
                persisted = view.last_index,
                recovered = last_index,
                "tail moved back to the highest written index"
            );
            view = state
                .update(|v| v.last_index = last_index)
                .map_err(TrailError::io)?;
        }

        let trail = Self {
            sessions: SessionPool::new(
                options.max_concurrent_reads,
                options.buffer_size,
                options.snapshot_buffer_size,
            ),
            dir,
            options,
            lock: LockManager::new(),
            partitions,
            snapshot: RwLock::new(snapshot.map(Arc::new)),
            state,
            last_term: AtomicU64::new(0),
            machine,
            disposed: AtomicBool::new(false),
        };

        let last_term = trail.read_term(view.last_index)?;
        trail.last_term.store(last_term, Ordering::Relaxed);

        info!(
            dir = ?trail.dir,
            partitions = recovered,
            last_index = view.last_index,
            commit_index = view.commit_index,
            snapshot_index,
            "audit trail opened"
        );

        if trail.options.replay_on_initialize {
            trail.replay().await?;
        }
        Ok(trail)
    }

    pub fn options(&self) -> &TrailOptions {
        &self.options
    }

    /// First live index: one past the snapshot, or 0 when no snapshot exists
    /// (index 0 being the ephemeral initial entry).
    pub fn first_index(&self) -> u64 {
        match self.snapshot_index() {
            0 => 0,
            index => index + 1,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.state.view().last_index
    }

    pub fn commit_index(&self) -> u64 {
        self.state.view().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.view().last_applied
    }

    pub fn term(&self) -> u64 {
        self.state.view().term
    }

    pub fn last_vote(&self) -> Option<Uuid> {
        self.state.view().last_vote
    }

    /// Term of the entry at `last_index`.
    pub fn last_entry_term(&self) -> u64 {
        self.last_term.load(Ordering::Relaxed)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.read().as_ref().map(|s| s.index()).unwrap_or(0)
    }

    /// A waitable handle over commit/term advances.
    pub fn commit_signal(&self) -> CommitSignal {
        CommitSignal::new(self.state.subscribe())
    }

    pub fn stats(&self) -> TrailStats {
        let snapshot = self.snapshot.read().clone();
        TrailStats {
            partitions: self.partitions.count(),
            log_bytes: self.partitions.bytes_on_disk(),
            snapshot_index: snapshot.as_ref().map(|s| s.index()).unwrap_or(0),
            snapshot_bytes: snapshot.as_ref().map(|s| s.bytes_on_disk()).unwrap_or(0),
            cached_entries: self.partitions.cached_entries(),
        }
    }

    /// Persist a term change, clearing the recorded vote when the term
    /// advances. Lower terms are ignored: the persisted term never moves
    /// backwards.
    pub async fn update_term(&self, term: u64, vote: Option<Uuid>) -> TrailResult<()> {
        self.ensure_open()?;
        let _guard = self.lock.write().await;
        let view = self.state.view();
        if term < view.term {
            warn!(term, current = view.term, "ignoring term regression");
            return Ok(());
        }
        if term == view.term && vote.is_none() {
            return Ok(());
        }
        self.state
            .update(|v| {
                v.term = term;
                v.last_vote = vote;
            })
            .map_err(TrailError::io)?;
        Ok(())
    }

    /// Append one entry at `start_index`; see `append_entries`.
    pub async fn append(&self, entry: LogEntry, start_index: u64) -> TrailResult<u64> {
        self.append_entries(vec![entry], start_index, false).await
    }

    /// Append a batch starting at `start_index`, returning the new last
    /// index. An append at the tail runs under the Write lock; rewriting an
    /// uncommitted suffix upgrades to Exclusive, and a rewrite shorter than
    /// the old tail zeroes the orphaned slots and moves the tail down.
    ///
    /// With `skip_committed`, entries that land at or below the commit index
    /// are dropped instead of rejected; the transport uses this when the
    /// leader resends a prefix the follower already committed.
    pub async fn append_entries(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
    ) -> TrailResult<u64> {
        self.ensure_open()?;
        if entries.iter().any(|e| e.is_snapshot()) {
            return Err(TrailError::SnapshotEntryRejected);
        }
        if entries.is_empty() {
            return Ok(self.state.view().last_index);
        }

        loop {
            let view = self.state.view();
            let Some(plan) = self.plan_append(&view, start_index, entries.len() as u64, skip_committed)?
            else {
                return Ok(view.last_index);
            };

            if !plan.rewrite {
                let guard = self.lock.write().await;
                let view = self.state.view();
                let Some(plan) =
                    self.plan_append(&view, start_index, entries.len() as u64, skip_committed)?
                else {
                    return Ok(view.last_index);
                };
                if plan.rewrite {
                    // Another appender moved the tail; retry with Exclusive.
                    drop(guard);
                    continue;
                }
                let (end, detached) = self.write_batch(&entries[plan.skipped..], plan.start, &view)?;
                drop(guard);
                delete_all(&detached);
                return Ok(end);
            }

            let guard = self.lock.exclusive().await;
            let view = self.state.view();
            let Some(plan) =
                self.plan_append(&view, start_index, entries.len() as u64, skip_committed)?
            else {
                return Ok(view.last_index);
            };
            let (end, detached) = self.write_batch(&entries[plan.skipped..], plan.start, &view)?;
            drop(guard);
            delete_all(&detached);
            return Ok(end);
        }
    }

    /// Read the inclusive index range `[from, to]` under a weak-read
    /// session. Indices at or below the snapshot index collapse into the
    /// single snapshot entry; index 0 of an unsnapshotted log is the
    /// ephemeral initial entry; indices past the tail are simply absent.
    pub async fn read(&self, from: u64, to: u64) -> TrailResult<Vec<LogEntry>> {
        self.ensure_open()?;
        if to < from {
            return Err(TrailError::InvalidIndex {
                index: to,
                first: from,
                last: u64::MAX,
            });
        }
        let span = to - from + 1;
        if span > i32::MAX as u64 {
            return Err(TrailError::RangeTooBig(span));
        }

        let _guard = self.lock.weak_read().await;
        let view = self.state.view();
        let snapshot = self.snapshot.read().clone();
        let mut session = self.sessions.open_session().await;

        let mut out = Vec::new();
        let mut next = from;
        match snapshot {
            Some(snap) if from <= snap.index() => {
                out.push(snap.read(session.buffer()).map_err(TrailError::io)?);
                next = snap.index() + 1;
            }
            None if from == 0 => {
                out.push(LogEntry::initial());
                next = 1;
            }
            _ => {}
        }

        let last = view.last_index.min(to);
        let mut index = next;
        while index <= last {
            let Some(partition) = self.partitions.try_get(&self.options, index) else {
                debug!(index, "partition detached mid-read, truncating result");
                break;
            };
            match partition.read(index, session.buffer()).map_err(TrailError::io)? {
                Some(entry) => out.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    /// Advance the commit index to `end_index` (clamped to the tail), apply
    /// every newly-committed entry to the state machine in order, and run
    /// the configured compaction. Returns the number of entries committed.
    pub async fn commit(&self, end_index: Option<u64>) -> TrailResult<u64> {
        self.ensure_open()?;
        let guard = self.lock.exclusive().await;
        let view = self.state.view();
        let target = end_index.unwrap_or(view.last_index).min(view.last_index);
        if target <= view.commit_index {
            return Ok(0);
        }
        let count = target - view.commit_index;
        self.state
            .update(|v| v.commit_index = target)
            .map_err(TrailError::io)?;

        let detached = match self.options.compaction_mode {
            CompactionMode::Sequential => {
                self.apply_committed().await?;
                let snapshot_index = self.snapshot_index();
                if target - snapshot_index >= self.options.records_per_partition {
                    self.build_snapshot_temp(target).await?;
                    self.install_built(target)?
                } else {
                    Vec::new()
                }
            }
            CompactionMode::Foreground => {
                let build_to = view.last_applied;
                let snapshot_index = self.snapshot_index();
                if build_to.saturating_sub(snapshot_index) >= self.options.records_per_partition {
                    let (applied, built) = futures::join!(
                        self.apply_committed(),
                        self.build_snapshot_temp(build_to)
                    );
                    applied?;
                    built?;
                    self.install_built(build_to)?
                } else {
                    self.apply_committed().await?;
                    Vec::new()
                }
            }
            CompactionMode::Background => {
                self.apply_committed().await?;
                Vec::new()
            }
        };

        drop(guard);
        delete_all(&detached);
        Ok(count)
    }

    /// Background compaction: fold up to `count` whole committed partitions
    /// into the snapshot, leaving at least one full partition between the
    /// snapshot and the applied tail so the head rewrite never races the
    /// appenders. Returns the number of partitions compacted.
    ///
    /// Runs entirely under the Compaction lock, which serializes builders
    /// and pins the partition list while leaving readers and writers free.
    pub async fn force_compaction(&self, count: u64) -> TrailResult<u64> {
        self.ensure_open()?;
        if count == 0 {
            return Ok(0);
        }
        let guard = self.lock.compaction().await;

        let view = self.state.view();
        let snapshot_index = self.snapshot_index();
        let records = self.options.records_per_partition;
        let available =
            (view.last_applied.saturating_sub(snapshot_index) / records).saturating_sub(1);
        let taking = count.min(available);
        if taking == 0 {
            return Ok(0);
        }

        let first_partition = self.options.partition_number(snapshot_index + 1);
        let up_to = ((first_partition + taking) * records - 1).min(view.last_applied);

        self.build_snapshot_temp(up_to).await?;
        let detached = self.install_built(up_to)?;

        drop(guard);
        delete_all(&detached);
        Ok(taking)
    }

    /// Install a snapshot received from the leader, replacing all indices at
    /// or below `snapshot_index`. The rename over the canonical file is the
    /// point of no return; re-installing the same snapshot is idempotent.
    pub async fn install_snapshot(&self, entry: LogEntry, snapshot_index: u64) -> TrailResult<()> {
        self.ensure_open()?;
        if !entry.is_snapshot() {
            return Err(TrailError::SnapshotEntryRejected);
        }

        let guard = self.lock.exclusive().await;
        let view = self.state.view();
        if snapshot_index == 0 || snapshot_index < view.commit_index {
            return Err(TrailError::InvalidIndex {
                index: snapshot_index,
                first: view.commit_index,
                last: u64::MAX,
            });
        }

        SnapshotFile::write_temp(
            &self.dir,
            &entry,
            snapshot_index,
            self.options.snapshot_buffer_size,
        )
        .map_err(TrailError::io)?;
        let detached = self.install_built(snapshot_index)?;

        // Reset the state machine to the received snapshot before the state
        // record claims it applied; replay covers a crash in between.
        self.machine
            .apply(snapshot_index, &entry)
            .await
            .map_err(TrailError::apply)?;

        self.last_term.store(entry.term, Ordering::Relaxed);
        self.state
            .update(|v| {
                v.commit_index = snapshot_index;
                v.last_applied = snapshot_index;
                v.last_index = v.last_index.max(snapshot_index);
            })
            .map_err(TrailError::io)?;

        info!(snapshot_index, "snapshot installed");
        drop(guard);
        delete_all(&detached);
        Ok(())
    }

    /// Drop the uncommitted suffix starting at `start_index`, zeroing the
    /// orphaned slots. Returns the number of entries dropped.
    pub async fn drop_from(&self, start_index: u64) -> TrailResult<u64> {
        self.ensure_open()?;
        let guard = self.lock.exclusive().await;
        let view = self.state.view();
        if start_index <= view.commit_index {
            return Err(TrailError::InvalidAppend {
                index: start_index,
                commit_index: view.commit_index,
            });
        }
        if start_index > view.last_index {
            return Ok(0);
        }

        let count = view.last_index - start_index + 1;
        for index in start_index..=view.last_index {
            if let Some(partition) = self.partitions.try_get(&self.options, index) {
                if partition.first_index() < start_index {
                    partition.clear_slot(index).map_err(TrailError::io)?;
                }
            }
        }
        let detached = self.partitions.detach_from(start_index);
        if let Some(partition) = self.partitions.try_get(&self.options, start_index) {
            partition.flush().map_err(TrailError::io)?;
        }

        let new_last = start_index - 1;
        let last_term = self.read_term(new_last)?;
        self.last_term.store(last_term, Ordering::Relaxed);
        self.state
            .update(|v| v.last_index = new_last)
            .map_err(TrailError::io)?;

        drop(guard);
        delete_all(&detached);
        Ok(count)
    }

    /// Re-apply the snapshot and every committed entry to the state
    /// machine, bringing it to the persisted state. The state machine must
    /// tolerate re-application from a clean slate.
    pub async fn replay(&self) -> TrailResult<()> {
        self.ensure_open()?;
        let _guard = self.lock.exclusive().await;

        let snapshot = self.snapshot.read().clone();
        let mut from = 0;
        if let Some(snap) = snapshot {
            let entry = {
                let mut buffer = self.sessions.compaction_buffer();
                snap.read(&mut buffer).map_err(TrailError::io)?
            };
            self.machine
                .apply(snap.index(), &entry)
                .await
                .map_err(TrailError::apply)?;
            self.last_term.store(entry.term, Ordering::Relaxed);
            from = snap.index();
        }

        let view = self.state.view();
        for index in from + 1..=view.commit_index {
            let entry = {
                let mut buffer = self.sessions.compaction_buffer();
                self.read_entry_scoped(index, &mut buffer)?
            };
            self.machine
                .apply(index, &entry)
                .await
                .map_err(TrailError::apply)?;
            self.last_term.store(entry.term, Ordering::Relaxed);
        }

        if view.last_applied < view.commit_index {
            self.state
                .update(|v| v.last_applied = v.commit_index)
                .map_err(TrailError::io)?;
        }
        debug!(commit_index = view.commit_index, "replay complete");
        Ok(())
    }

    /// Flush everything and refuse further operations.
    pub async fn close(&self) -> TrailResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.lock.exclusive().await;
        let mut failed = None;
        self.partitions.for_each(|partition| {
            if let Err(err) = partition.flush() {
                failed.get_or_insert(err);
            }
        });
        if let Some(err) = failed {
            return Err(TrailError::io(err));
        }
        info!(dir = ?self.dir, "audit trail closed");
        Ok(())
    }

    fn ensure_open(&self) -> TrailResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TrailError::Disposed);
        }
        Ok(())
    }

    fn plan_append(
        &self,
        view: &StateView,
        start_index: u64,
        entry_count: u64,
        skip_committed: bool,
    ) -> TrailResult<Option<AppendPlan>> {
        if start_index > view.tail_index() {
            return Err(TrailError::InvalidIndex {
                index: start_index,
                first: self.first_index(),
                last: view.tail_index(),
            });
        }

        let mut start = start_index;
        let mut skipped = 0u64;
        if start <= view.commit_index {
            if !skip_committed {
                return Err(TrailError::InvalidAppend {
                    index: start_index,
                    commit_index: view.commit_index,
                });
            }
            skipped = (view.commit_index + 1 - start).min(entry_count);
            start += skipped;
            if skipped == entry_count {
                return Ok(None);
            }
        }

        Ok(Some(AppendPlan {
            start,
            skipped: skipped as usize,
            rewrite: start != view.tail_index(),
        }))
    }

    /// Write `entries` at `start`; caller holds the Write lock (pure append)
    /// or Exclusive (rewrite). Returns the new last index and any tail
    /// partitions detached by a shrinking rewrite, to be deleted after the
    /// lock is released.
    fn write_batch(
        &self,
        entries: &[LogEntry],
        start: u64,
        view: &StateView,
    ) -> TrailResult<(u64, Vec<Arc<Partition>>)> {
        let mut buffer = self.sessions.write_buffer();
        let mut current: Option<Arc<Partition>> = None;

        for (i, entry) in entries.iter().enumerate() {
            let index = start + i as u64;
            let partition = self
                .partitions
                .get_or_create(&self.options, &self.dir, index)
                .map_err(TrailError::io)?;
            if let Some(previous) = &current {
                if previous.number() != partition.number() {
                    previous.flush().map_err(TrailError::io)?;
                }
            }
            partition
                .write(entry, index, &mut buffer, true)
                .map_err(TrailError::io)?;
            current = Some(partition);
        }

        let end = start + entries.len() as u64 - 1;

        let mut detached = Vec::new();
        if view.last_index > end {
            // The rewrite was shorter than the old tail: zero the orphaned
            // slots and drop partitions that now lie wholly past the end.
            for index in end + 1..=view.last_index {
                if let Some(partition) = self.partitions.try_get(&self.options, index) {
                    if partition.first_index() <= end {
                        partition.clear_slot(index).map_err(TrailError::io)?;
                    }
                }
            }
            detached = self.partitions.detach_from(end + 1);
        }

        if let Some(partition) = &current {
            partition.flush().map_err(TrailError::io)?;
            if self.options.cache_eviction == CacheEviction::OnFlush {
                partition.evict_cached_up_to(view.commit_index);
            }
        }

        self.last_term
            .store(entries.last().map(|e| e.term).unwrap_or(0), Ordering::Relaxed);
        self.state
            .update(|v| v.last_index = end)
            .map_err(TrailError::io)?;
        Ok((end, detached))
    }

    async fn apply_committed(&self) -> TrailResult<()> {
        let view = self.state.view();
        let target = view.commit_index;
        let mut index = view.last_applied + 1;
        while index <= target {
            let entry = {
                let mut buffer = self.sessions.write_buffer();
                self.read_entry_scoped(index, &mut buffer)?
            };
            self.machine
                .apply(index, &entry)
                .await
                .map_err(TrailError::apply)?;
            self.last_term.store(entry.term, Ordering::Relaxed);

            if self.options.cache_eviction == CacheEviction::OnCommit {
                if let Some(partition) = self.partitions.try_get(&self.options, index) {
                    partition.evict_cached_up_to(index);
                }
            }
            index += 1;
        }

        if target > view.last_applied {
            self.state
                .update(|v| v.last_applied = target)
                .map_err(TrailError::io)?;
        }
        Ok(())
    }

    /// Fold everything in `(snapshot_index, up_to]` into a fresh snapshot
    /// and stream it to `snapshot.new`.
    async fn build_snapshot_temp(&self, up_to: u64) -> TrailResult<()> {
        let snapshot = self.snapshot.read().clone();
        let snapshot_index = snapshot.as_ref().map(|s| s.index()).unwrap_or(0);
        debug_assert!(up_to > snapshot_index);

        let mut builder = self.machine.snapshot_builder();
        if let Some(snap) = snapshot {
            let entry = {
                let mut buffer = self.sessions.compaction_buffer();
                snap.read(&mut buffer).map_err(TrailError::io)?
            };
            builder
                .apply(snapshot_index, &entry)
                .await
                .map_err(TrailError::apply)?;
        }

        let start = snapshot_index + 1;
        let mut index = start;
        while index <= up_to {
            let entry = {
                let mut buffer = self.sessions.compaction_buffer();
                self.read_entry_scoped(index, &mut buffer)?
            };
            builder
                .apply(index, &entry)
                .await
                .map_err(TrailError::apply)?;

            let next = index + 1;
            // The builder may skip ranges it can prove are irrelevant.
            index = builder.adjust_index(start, up_to, next).clamp(next, up_to + 1);
        }

        let mut payload = Vec::new();
        builder.write_to(&mut payload).map_err(TrailError::apply)?;
        let entry = LogEntry::snapshot(self.read_term(up_to)?, payload);

        SnapshotFile::write_temp(&self.dir, &entry, up_to, self.options.snapshot_buffer_size)
            .map_err(TrailError::io)?;
        debug!(up_to, "snapshot written to temp file");
        Ok(())
    }

    /// Swap `snapshot.new` over the canonical file and detach every
    /// partition it covers. Caller holds Exclusive or Compaction; the
    /// returned partitions are deleted after that lock is released.
    fn install_built(&self, up_to: u64) -> TrailResult<Vec<Arc<Partition>>> {
        let installed = SnapshotFile::install(&self.dir).map_err(TrailError::io)?;
        *self.snapshot.write() = Some(Arc::new(installed));
        let detached = self.partitions.detach_covered(up_to);
        info!(
            snapshot_index = up_to,
            detached = detached.len(),
            "snapshot swapped in"
        );
        Ok(detached)
    }

    /// Read a committed entry; a missing partition or empty slot here means
    /// the on-disk state is corrupt.
    fn read_entry_scoped(&self, index: u64, scratch: &mut Vec<u8>) -> TrailResult<LogEntry> {
        let partition = self
            .partitions
            .try_get(&self.options, index)
            .ok_or(TrailError::MissingPartition(index))?;
        partition
            .read(index, scratch)
            .map_err(TrailError::io)?
            .ok_or(TrailError::MissingPartition(index))
    }

    /// Term of the entry at `index`: 0 for the initial entry, the snapshot
    /// term at the snapshot index, otherwise the partition metadata.
    fn read_term(&self, index: u64) -> TrailResult<u64> {
        if index == 0 {
            return Ok(0);
        }
        if let Some(snap) = self.snapshot.read().as_ref() {
            if index <= snap.index() {
                return Ok(snap.meta().term);
            }
        }
        let partition = self
            .partitions
            .try_get(&self.options, index)
            .ok_or(TrailError::MissingPartition(index))?;
        partition
            .read_meta(index)
            .map_err(TrailError::io)?
            .map(|meta| meta.term)
            .ok_or(TrailError::MissingPartition(index))
    }
}

struct AppendPlan {
    start: u64,
    skipped: usize,
    rewrite: bool,
}

fn delete_all(partitions: &[Arc<Partition>]) {
    for partition in partitions {
        partition.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SnapshotBuilder;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct NullMachine;

    #[async_trait]
    impl StateMachine for NullMachine {
        async fn apply(&self, _index: u64, _entry: &LogEntry) -> Result<()> {
            Ok(())
        }

        fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder> {
            Box::new(NullBuilder)
        }
    }

    struct NullBuilder;

    #[async_trait]
    impl SnapshotBuilder for NullBuilder {
        async fn apply(&mut self, _index: u64, _entry: &LogEntry) -> Result<()> {
            Ok(())
        }

        fn write_to(&self, _writer: &mut dyn std::io::Write) -> Result<()> {
            Ok(())
        }
    }

    async fn open_trail(dir: &std::path::Path) -> AuditTrail {
        let options = TrailOptions {
            records_per_partition: 4,
            ..Default::default()
        };
        AuditTrail::open(dir, options, Arc::new(NullMachine))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_rejects_gap() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        let err = trail.append(LogEntry::new(1, b"x".to_vec()), 5).await;
        assert!(matches!(err, Err(TrailError::InvalidIndex { .. })));
    }

    #[tokio::test]
    async fn test_append_rejects_snapshot_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        let err = trail.append(LogEntry::snapshot(1, vec![]), 1).await;
        assert!(matches!(err, Err(TrailError::SnapshotEntryRejected)));
    }

    #[tokio::test]
    async fn test_append_below_commit_rejected_without_skip() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        for i in 1..=3 {
            trail.append(LogEntry::new(1, vec![i as u8]), i).await.unwrap();
        }
        trail.commit(Some(2)).await.unwrap();

        let err = trail.append(LogEntry::new(1, b"x".to_vec()), 2).await;
        assert!(matches!(err, Err(TrailError::InvalidAppend { .. })));
    }

    #[tokio::test]
    async fn test_skip_committed_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        for i in 1..=3 {
            trail.append(LogEntry::new(1, vec![i as u8]), i).await.unwrap();
        }
        trail.commit(Some(3)).await.unwrap();

        // Leader resends 2..=5; the committed prefix 2..=3 is skipped.
        let batch: Vec<LogEntry> = (2..=5).map(|i| LogEntry::new(1, vec![i as u8])).collect();
        let end = trail.append_entries(batch, 2, true).await.unwrap();
        assert_eq!(end, 5);
        assert_eq!(trail.commit_index(), 3);

        let read = trail.read(4, 5).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].payload, vec![4]);
    }

    #[tokio::test]
    async fn test_fully_committed_batch_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        for i in 1..=3 {
            trail.append(LogEntry::new(1, vec![i as u8]), i).await.unwrap();
        }
        trail.commit(None).await.unwrap();

        let batch = vec![LogEntry::new(1, vec![9]), LogEntry::new(1, vec![9])];
        let end = trail.append_entries(batch, 1, true).await.unwrap();
        assert_eq!(end, 3);
        assert_eq!(trail.read(2, 2).await.unwrap()[0].payload, vec![2]);
    }

    #[tokio::test]
    async fn test_disposed_after_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let trail = open_trail(dir.path()).await;
        trail.close().await.unwrap();
        assert!(matches!(
            trail.append(LogEntry::new(1, vec![]), 1).await,
            Err(TrailError::Disposed)
        ));
        assert!(matches!(trail.read(0, 0).await, Err(TrailError::Disposed)));
        // Closing twice is fine.
        trail.close().await.unwrap();
    }

    struct CountingMachine {
        applied: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl StateMachine for CountingMachine {
        async fn apply(&self, index: u64, _entry: &LogEntry) -> Result<()> {
            self.applied.lock().push(index);
            Ok(())
        }

        fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder> {
            Box::new(NullBuilder)
        }
    }

    #[tokio::test]
    async fn test_commit_applies_in_order_exactly_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let machine = Arc::new(CountingMachine {
            applied: Mutex::new(Vec::new()),
        });
        let options = TrailOptions {
            records_per_partition: 8,
            ..Default::default()
        };
        let trail = AuditTrail::open(dir.path(), options, machine.clone())
            .await
            .unwrap();

        for i in 1..=5 {
            trail.append(LogEntry::new(1, vec![i as u8]), i).await.unwrap();
        }
        assert_eq!(trail.commit(Some(3)).await.unwrap(), 3);
        assert_eq!(trail.commit(Some(3)).await.unwrap(), 0);
        assert_eq!(trail.commit(None).await.unwrap(), 2);

        assert_eq!(*machine.applied.lock(), vec![1, 2, 3, 4, 5]);
    }
}
