use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Async lock over the single logical log resource, with four modes:
///
/// |            | WeakRead | Write | Compaction | Exclusive |
/// |------------|:--------:|:-----:|:----------:|:---------:|
/// | WeakRead   |    ok    |  ok   |     ok     |     -     |
/// | Write      |    ok    |   -   |     ok     |     -     |
/// | Compaction |    ok    |  ok   |      -     |     -     |
/// | Exclusive  |     -    |   -   |      -     |     -     |
///
/// WeakRead admits any number of readers and never blocks writers; it only
/// pins the partition list against structural reorganization. Write
/// serializes appenders, Compaction serializes snapshot builders, and
/// Exclusive is Write and Compaction held together with all readers drained.
///
/// Pending Write/Compaction/Exclusive acquisitions take priority over new
/// WeakRead acquisitions, so a steady reader stream cannot starve the
/// writers. Dropping an acquisition future before it resolves leaves no
/// state behind.
pub(crate) struct LockManager {
    state: Mutex<LockState>,
    notify: Notify,
}

#[derive(Default)]
struct LockState {
    weak_readers: usize,
    writer: bool,
    compactor: bool,
    exclusive: bool,
    /// Pending Write/Compaction/Exclusive acquisitions; new weak readers
    /// wait while this is non-zero.
    priority_waiters: usize,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState::default()),
            notify: Notify::new(),
        })
    }

    pub async fn weak_read(self: &Arc<Self>) -> WeakReadGuard {
        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot lose the wakeup.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.exclusive && state.priority_waiters == 0 {
                    state.weak_readers += 1;
                    return WeakReadGuard { lock: self.clone() };
                }
            }
            notified.await;
        }
    }

    pub async fn write(self: &Arc<Self>) -> WriteGuard {
        let _intent = PriorityIntent::register(self);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.writer && !state.exclusive {
                    state.writer = true;
                    return WriteGuard { lock: self.clone() };
                }
            }
            notified.await;
        }
    }

    pub async fn compaction(self: &Arc<Self>) -> CompactionGuard {
        let _intent = PriorityIntent::register(self);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.compactor && !state.exclusive {
                    state.compactor = true;
                    return CompactionGuard { lock: self.clone() };
                }
            }
            notified.await;
        }
    }

    pub async fn exclusive(self: &Arc<Self>) -> ExclusiveGuard {
        let _intent = PriorityIntent::register(self);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.writer && !state.compactor && !state.exclusive && state.weak_readers == 0
                {
                    state.exclusive = true;
                    return ExclusiveGuard { lock: self.clone() };
                }
            }
            notified.await;
        }
    }

    fn release<F>(&self, unset: F)
    where
        F: FnOnce(&mut LockState),
    {
        unset(&mut self.state.lock());
        self.notify.notify_waiters();
    }
}

/// Keeps new weak readers out while a priority acquisition is pending.
/// Cancel-safe: the counter is unwound on drop whether or not the
/// acquisition completed.
struct PriorityIntent {
    lock: Arc<LockManager>,
}

impl PriorityIntent {
    fn register(lock: &Arc<LockManager>) -> Self {
        lock.state.lock().priority_waiters += 1;
        Self { lock: lock.clone() }
    }
}

impl Drop for PriorityIntent {
    fn drop(&mut self) {
        self.lock.state.lock().priority_waiters -= 1;
        self.lock.notify.notify_waiters();
    }
}

pub(crate) struct WeakReadGuard {
    lock: Arc<LockManager>,
}

impl Drop for WeakReadGuard {
    fn drop(&mut self) {
        self.lock.release(|s| s.weak_readers -= 1);
    }
}

pub(crate) struct WriteGuard {
    lock: Arc<LockManager>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.release(|s| s.writer = false);
    }
}

pub(crate) struct CompactionGuard {
    lock: Arc<LockManager>,
}

impl Drop for CompactionGuard {
    fn drop(&mut self) {
        self.lock.release(|s| s.compactor = false);
    }
}

pub(crate) struct ExclusiveGuard {
    lock: Arc<LockManager>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.lock.release(|s| s.exclusive = false);
    }
}
