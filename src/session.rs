use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of reusable I/O contexts: `max_concurrent_reads` reader sessions,
/// each owning a byte buffer, plus the distinguished writer and compaction
/// buffers.
///
/// Reader sessions are claimed through a semaphore, so concurrent readers
/// are bounded and buffer reuse never contends with allocation on the read
/// path. The writer buffer is serialized by the Write lock and the
/// compaction buffer by the Compaction lock, so both are plain mutexes that
/// are only ever claimed uncontended.
pub(crate) struct SessionPool {
    permits: Arc<Semaphore>,
    read_buffers: Mutex<Vec<Vec<u8>>>,
    write_buffer: Mutex<Vec<u8>>,
    compaction_buffer: Mutex<Vec<u8>>,
}

impl SessionPool {
    pub fn new(max_concurrent_reads: usize, buffer_size: usize, snapshot_buffer_size: usize) -> Arc<Self> {
        let read_buffers = (0..max_concurrent_reads)
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(max_concurrent_reads)),
            read_buffers: Mutex::new(read_buffers),
            write_buffer: Mutex::new(Vec::with_capacity(buffer_size)),
            compaction_buffer: Mutex::new(Vec::with_capacity(snapshot_buffer_size)),
        })
    }

    /// Claim a reader session, waiting for a free slot if all are in use.
    pub async fn open_session(self: &Arc<Self>) -> Session {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("session pool semaphore closed");
        let buffer = self
            .read_buffers
            .lock()
            .pop()
            .expect("session pool freelist exhausted with permit held");
        Session {
            buffer: Some(buffer),
            pool: self.clone(),
            _permit: permit,
        }
    }

    /// The writer session's buffer; callers hold the Write or Exclusive lock.
    pub fn write_buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.write_buffer.lock()
    }

    /// The compaction session's buffer; callers hold the Compaction or
    /// Exclusive lock.
    pub fn compaction_buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.compaction_buffer.lock()
    }
}

/// A claimed reader session. The buffer is returned to the pool on drop,
/// keeping its grown capacity.
pub(crate) struct Session {
    buffer: Option<Vec<u8>>,
    pool: Arc<SessionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().expect("session buffer taken")
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.clear();
            self.pool.read_buffers.lock().push(buffer);
        }
    }
}
