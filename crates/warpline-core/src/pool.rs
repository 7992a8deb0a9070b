//! Slab message pool.
//!
//! Fixed-size buffers recycled through a free list behind one coarse lock.
//! [`SlabPool::acquire`] hands out an exclusively owned [`SlabBuffer`];
//! [`SlabBuffer::release`] consumes it. Because release takes the buffer by
//! value, releasing twice or touching a buffer after release does not
//! compile:
//!
//! ```compile_fail
//! use warpline_core::{PoolGrowth, SlabPool};
//!
//! let pool = SlabPool::new(1, PoolGrowth::Fixed);
//! let Ok(slab) = pool.acquire() else { return };
//! slab.release();
//! slab.release();
//! ```
//!
//! A buffer dropped without being released still goes back to the free list,
//! but is logged: it means some path forgot its half of the protocol.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use warpline_proto::SLAB_MSG_SIZE;

use crate::config::PoolGrowth;

/// Pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every slab is in use and growth is not allowed.
    #[error("slab pool exhausted: {outstanding} of {limit} slabs in use")]
    Exhausted {
        /// Slabs currently handed out
        outstanding: usize,
        /// Maximum slabs the pool may allocate
        limit: usize,
    },

    /// Data does not fit in one slab.
    #[error("{len} bytes do not fit in a {max}-byte slab", max = SLAB_MSG_SIZE)]
    Overflow {
        /// Bytes offered
        len: usize,
    },
}

struct FreeList {
    slabs: Vec<Box<[u8]>>,
    allocated: usize,
}

struct PoolInner {
    free: Mutex<FreeList>,
    limit: usize,
}

impl PoolInner {
    fn put_back(&self, mut slab: Box<[u8]>) {
        slab.fill(0);
        self.free.lock().slabs.push(slab);
    }
}

/// Shared handle to a slab pool. Clones refer to the same free list.
#[derive(Clone)]
pub struct SlabPool {
    inner: Arc<PoolInner>,
}

impl SlabPool {
    /// Pool with `capacity` slabs allocated up front.
    pub fn new(capacity: usize, growth: PoolGrowth) -> Self {
        let limit = match growth {
            PoolGrowth::Fixed => capacity,
            PoolGrowth::Grow { max_slabs } => max_slabs.max(capacity),
        };
        let slabs = (0..capacity).map(|_| new_slab()).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(FreeList { slabs, allocated: capacity }),
                limit,
            }),
        }
    }

    /// Take a zeroed slab, growing the pool if allowed.
    pub fn acquire(&self) -> Result<SlabBuffer, PoolError> {
        let mut free = self.inner.free.lock();
        let data = match free.slabs.pop() {
            Some(slab) => slab,
            None if free.allocated < self.inner.limit => {
                free.allocated += 1;
                debug!(allocated = free.allocated, limit = self.inner.limit, "slab pool grew");
                new_slab()
            },
            None => {
                return Err(PoolError::Exhausted {
                    outstanding: free.allocated,
                    limit: self.inner.limit,
                });
            },
        };
        drop(free);
        Ok(SlabBuffer { data, len: 0, pool: Arc::clone(&self.inner) })
    }

    /// Return a slab. Equivalent to [`SlabBuffer::release`].
    pub fn release(&self, slab: SlabBuffer) {
        slab.release();
    }

    /// Slabs currently handed out.
    pub fn outstanding(&self) -> usize {
        let free = self.inner.free.lock();
        free.allocated - free.slabs.len()
    }

    /// Slabs sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner.free.lock().slabs.len()
    }

    /// Maximum slabs this pool will ever allocate.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }
}

impl std::fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let free = self.inner.free.lock();
        f.debug_struct("SlabPool")
            .field("allocated", &free.allocated)
            .field("available", &free.slabs.len())
            .field("limit", &self.inner.limit)
            .finish()
    }
}

fn new_slab() -> Box<[u8]> {
    vec![0u8; SLAB_MSG_SIZE].into_boxed_slice()
}

/// One pool-owned buffer of [`SLAB_MSG_SIZE`] bytes.
///
/// Not `Clone`: there is exactly one owner until [`release`](Self::release).
pub struct SlabBuffer {
    data: Box<[u8]>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl SlabBuffer {
    /// The filled prefix.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the contents with `bytes`.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        if bytes.len() > self.data.len() {
            return Err(PoolError::Overflow { len: bytes.len() });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Let `write` fill the whole slab, keeping the prefix it reports.
    pub(crate) fn write_with<F, E>(&mut self, write: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        let written = write(&mut self.data)?;
        self.len = written.min(self.data.len());
        Ok(self.len)
    }

    /// Give the slab back to its pool.
    pub fn release(mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put_back(data);
    }
}

impl Drop for SlabBuffer {
    fn drop(&mut self) {
        if self.data.is_empty() {
            return;
        }
        warn!(len = self.len, "slab dropped without release, reclaiming");
        let data = std::mem::take(&mut self.data);
        self.pool.put_back(data);
    }
}

impl std::fmt::Debug for SlabBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabBuffer").field("len", &self.len).finish_non_exhaustive()
    }
}
