//! Fixed-size block pools with generational growth.
//!
//! # Responsibilities
//! - Hand out blocks of `block_size` bytes up to a per-generation limit
//! - Grow by creating a new generation with twice the capacity
//! - Keep retired generations alive until their blocks come back
//!
//! Oversized requests bypass the pool and allocate exactly what is asked.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;

use crate::buffer::block::MessageBlock;
use crate::buffer::spin::SpinLock;
use crate::buffer::{DEFAULT_CONNECTION_BUFFER_SIZE, DEFAULT_DATA_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::observability::metrics;

static GENERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size of one data block in bytes.
    pub block_size: usize,
    /// Blocks in the first generation.
    pub block_count: usize,
    /// Upper bound on blocks in a single generation.
    pub max_block_count: usize,
}

impl PoolConfig {
    /// Pool sized from a byte budget, as connections do.
    pub fn with_budget(block_size: usize, budget: usize) -> Self {
        let block_size = block_size.max(1);
        let block_count = (budget / block_size).max(1);
        Self {
            block_size,
            block_count,
            max_block_count: block_count.saturating_mul(64),
        }
    }

    /// Two blocks: one in flight, one duplicated for the write completion.
    pub fn write_only(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            block_count: 2,
            max_block_count: 128,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::with_budget(DEFAULT_DATA_BLOCK_SIZE, DEFAULT_CONNECTION_BUFFER_SIZE)
    }
}

/// One allocation generation. Blocks keep their generation alive.
#[derive(Debug)]
pub(crate) struct Generation {
    id: u64,
    block_size: usize,
    capacity: usize,
    allocated: AtomicUsize,
    outstanding: AtomicUsize,
    free: SpinLock<Vec<BytesMut>>,
}

impl Generation {
    fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            id: GENERATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            block_size,
            capacity,
            allocated: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            free: SpinLock::new(Vec::with_capacity(capacity.min(1024))),
        }
    }

    fn try_acquire(&self) -> Option<BytesMut> {
        if let Some(mut buf) = self.free.lock().pop() {
            buf.clear();
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            return Some(buf);
        }
        let mut allocated = self.allocated.load(Ordering::Relaxed);
        loop {
            if allocated >= self.capacity {
                return None;
            }
            match self.allocated.compare_exchange_weak(
                allocated,
                allocated + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => allocated = actual,
            }
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(BytesMut::with_capacity(self.block_size))
    }

    pub(crate) fn release(&self, mut buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if buf.capacity() >= self.block_size {
            buf.clear();
            self.free.lock().push(buf);
        } else {
            // The payload was split off; the slot is gone for good.
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        tracing::trace!(
            generation = self.id,
            capacity = self.capacity,
            "Buffer pool generation released"
        );
    }
}

/// Per-connection (or per-acceptor) block pool.
#[derive(Debug)]
pub struct MessagePool {
    config: PoolConfig,
    current: SpinLock<Arc<Generation>>,
    growths: AtomicUsize,
}

impl MessagePool {
    pub fn new(config: PoolConfig) -> Self {
        let first = Arc::new(Generation::new(config.block_size, config.block_count));
        Self {
            config,
            current: SpinLock::new(first),
            growths: AtomicUsize::new(0),
        }
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Blocks the current generation may hand out.
    pub fn capacity(&self) -> usize {
        self.current.lock().capacity
    }

    /// Number of times the pool has grown.
    pub fn growths(&self) -> usize {
        self.growths.load(Ordering::Relaxed)
    }

    /// Blocks from the current generation still owned by someone.
    pub fn outstanding(&self) -> usize {
        self.current.lock().outstanding()
    }

    /// Take a writable buffer of at least `size` bytes.
    ///
    /// Requests up to the block size come from the pool. On exhaustion the
    /// pool grows once and retries; a second failure is
    /// [`Error::InsufficientMemory`].
    pub fn allocate(&self, size: usize) -> Result<PooledBytes> {
        if size > self.config.block_size {
            return Ok(PooledBytes::unpooled(size));
        }
        let generation = Arc::clone(&self.current.lock());
        if let Some(buf) = generation.try_acquire() {
            return Ok(PooledBytes::pooled(buf, generation));
        }
        let grown = self.grow(&generation)?;
        match grown.try_acquire() {
            Some(buf) => Ok(PooledBytes::pooled(buf, grown)),
            None => Err(Error::InsufficientMemory(format!(
                "message block pool with {} blocks of {} bytes is exhausted",
                grown.capacity, grown.block_size
            ))),
        }
    }

    /// Allocate and fill a block with `data`.
    pub fn allocate_with(&self, data: &[u8]) -> Result<MessageBlock> {
        let mut buf = self.allocate(data.len())?;
        buf.as_mut().extend_from_slice(data);
        Ok(buf.freeze())
    }

    fn grow(&self, exhausted: &Arc<Generation>) -> Result<Arc<Generation>> {
        let mut current = self.current.lock();
        if !Arc::ptr_eq(&current, exhausted) {
            // Someone else already grew it.
            return Ok(Arc::clone(&current));
        }
        let capacity = exhausted.capacity.saturating_mul(2);
        if capacity > self.config.max_block_count {
            return Err(Error::InsufficientMemory(format!(
                "message block pool can not grow beyond {} blocks",
                self.config.max_block_count
            )));
        }
        let next = Arc::new(Generation::new(self.config.block_size, capacity));
        tracing::debug!(
            old_generation = exhausted.id,
            new_generation = next.id,
            capacity,
            outstanding = exhausted.outstanding(),
            "Message block pool grown"
        );
        *current = Arc::clone(&next);
        drop(current);
        self.growths.fetch_add(1, Ordering::Relaxed);
        metrics::pool_grown();
        Ok(next)
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// A writable block that has not been shared yet.
#[derive(Debug)]
pub struct PooledBytes {
    buf: BytesMut,
    origin: Option<Arc<Generation>>,
    receive_start: Option<Instant>,
}

impl PooledBytes {
    fn pooled(buf: BytesMut, origin: Arc<Generation>) -> Self {
        Self {
            buf,
            origin: Some(origin),
            receive_start: None,
        }
    }

    fn unpooled(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            origin: None,
            receive_start: None,
        }
    }

    /// Stamp the moment a read was issued into this buffer.
    pub fn mark_receive_start(&mut self) {
        self.receive_start = Some(Instant::now());
    }

    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Convert into a shared block, stamping the receive time.
    pub fn freeze(mut self) -> MessageBlock {
        let buf = std::mem::take(&mut self.buf);
        MessageBlock::from_parts(buf, self.origin.take(), self.receive_start)
    }
}

impl AsMut<BytesMut> for PooledBytes {
    fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let Some(origin) = self.origin.take() {
            origin.release(std::mem::take(&mut self.buf));
        }
    }
}
