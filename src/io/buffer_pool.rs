//! Lock-free packet buffer pool
//!
//! The relay moves MTU-sized datagrams at high rates; this pool amortizes
//! the allocations with a `crossbeam_queue::ArrayQueue` of fixed-size
//! buffers. Buffers return to the pool when dropped. Two instances exist at
//! runtime: one for the relay receive/send path and one shared by the
//! per-association readers.
//!
//! Payloads larger than the buffer size bypass the pool entirely — the
//! caller allocates a one-shot buffer that is simply dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Buffer size covering a full Ethernet-MTU datagram
pub const PACKET_BUFFER_SIZE: usize = 1500;

/// Default number of pooled buffers
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Counters for pool behavior
#[derive(Debug, Default)]
pub struct PacketPoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl PacketPoolStats {
    /// Buffers allocated because the pool was empty
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Buffers served from the pool
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Buffers returned to the pool
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers dropped because the pool was full
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Fixed-size buffer pool for datagram I/O.
#[derive(Debug)]
pub struct PacketBufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    stats: PacketPoolStats,
}

impl PacketBufferPool {
    /// Create a pool holding up to `capacity` buffers of
    /// [`PACKET_BUFFER_SIZE`] bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            stats: PacketPoolStats::default(),
        }
    }

    /// Create a pool with [`DEFAULT_POOL_CAPACITY`] buffers.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }

    /// Borrow a buffer, allocating if the pool is empty.
    ///
    /// The buffer always has length [`PACKET_BUFFER_SIZE`]; contents are
    /// whatever the previous user left (receive paths overwrite it).
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PacketBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf.resize(PACKET_BUFFER_SIZE, 0);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; PACKET_BUFFER_SIZE]
        };
        PacketBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently parked in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> &PacketPoolStats {
        &self.stats
    }

    fn return_buffer(&self, buffer: Vec<u8>) {
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A buffer borrowed from a [`PacketBufferPool`]; returns on drop.
#[derive(Debug)]
pub struct PacketBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<PacketBufferPool>,
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PacketBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}
