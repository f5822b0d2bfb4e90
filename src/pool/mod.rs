//! Bounded buffer pool.
//!
//! Readers that materialize one chunk at a time (the window strategy) borrow
//! their read buffers from a [`BufferPool`] instead of allocating per chunk.
//!
//! # Contract
//!
//! - [`BufferPool::acquire`] returns `None` when the request is larger than
//!   the pool's block size or when every buffer is lent out and the optional
//!   bounded wait elapses. Callers must then fall back to an unpooled
//!   allocation; exhaustion is never an error.
//! - A [`PooledBuffer`] returns itself to the pool when dropped. Because the
//!   buffer is owned by whoever holds it (typically a [`Chunk`](crate::Chunk)),
//!   the pool can never hand out memory that is still referenced.
//!
//! # Concurrency model
//!
//! The pool is an explicitly constructed, reference-counted handle. Idle
//! buffers sit in a bounded `crossbeam` channel, so `acquire` and release are
//! lock-free and a waiting `acquire` is woken as soon as a buffer comes back.

#[cfg(test)]
mod tests;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Pool
// ------------------------------------------------------------------------------------------------

/// Shared pool of fixed-capacity byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Capacity of every pooled buffer.
    block_size: usize,

    /// Maximum number of buffers ever allocated.
    capacity: usize,

    /// How long `acquire` waits for a returned buffer once all are lent out.
    wait: Duration,

    /// Number of buffers allocated so far.
    allocated: AtomicUsize,

    /// Idle buffers.
    idle_tx: Sender<Vec<u8>>,
    idle_rx: Receiver<Vec<u8>>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.inner.block_size)
            .field("capacity", &self.inner.capacity)
            .field("allocated", &self.inner.allocated.load(Ordering::Relaxed))
            .field("idle", &self.inner.idle_rx.len())
            .finish()
    }
}

impl BufferPool {
    /// Creates a pool of up to `capacity` buffers of `block_size` bytes.
    ///
    /// Buffers are allocated lazily on first demand.
    pub fn new(block_size: usize, capacity: usize, wait: Duration) -> Self {
        let (idle_tx, idle_rx) = channel::bounded(capacity.max(1));
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                capacity,
                wait,
                allocated: AtomicUsize::new(0),
                idle_tx,
                idle_rx,
            }),
        }
    }

    /// Capacity of every pooled buffer.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle_rx.len()
    }

    /// Number of buffers allocated so far.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Borrows a zero-length buffer able to hold `size` bytes.
    ///
    /// Returns `None` if `size` exceeds the block size or the pool stays
    /// exhausted for the configured wait.
    pub fn acquire(&self, size: usize) -> Option<PooledBuffer> {
        let inner = &self.inner;
        if size > inner.block_size {
            trace!(size, block_size = inner.block_size, "request larger than pool block");
            return None;
        }

        if let Ok(buf) = inner.idle_rx.try_recv() {
            return Some(self.wrap(buf));
        }

        // Reserve an allocation slot if the pool has not reached capacity.
        let reserved = inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < inner.capacity).then_some(n + 1)
            })
            .is_ok();
        if reserved {
            return Some(self.wrap(Vec::with_capacity(inner.block_size)));
        }

        if inner.wait.is_zero() {
            return None;
        }

        match inner.idle_rx.recv_timeout(inner.wait) {
            Ok(buf) => Some(self.wrap(buf)),
            Err(_) => {
                trace!(wait = ?inner.wait, "pool exhausted after bounded wait");
                None
            }
        }
    }

    /// Returns a buffer to the idle list.
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() < self.inner.block_size {
            // Shrunk by the borrower; replace rather than pool a short buffer.
            buf = Vec::with_capacity(self.inner.block_size);
        }
        if self.inner.idle_tx.try_send(buf).is_err() {
            // Only possible if more buffers came back than were allocated.
            self.inner.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn wrap(&self, buf: Vec<u8>) -> PooledBuffer {
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PooledBuffer
// ------------------------------------------------------------------------------------------------

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}
