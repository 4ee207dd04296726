//! Lock-free byte ring buffer for decoded PCM
//!
//! Single-producer / single-consumer circular buffer carrying raw bytes
//! between the decode path (producer, cooperative context) and the output
//! provider (consumer, interrupt context).
//!
//! Design:
//! - Producer (refill pass): appends decoded PCM bytes
//! - Consumer (provider callback): drains bytes without any locks
//! - One byte of capacity is always reserved so a full buffer is
//!   distinguishable from an empty one: `used + free == capacity - 1`
//! - Wrap-around is handled by splitting each operation into at most two
//!   contiguous copies (tail segment, then head segment)
//!
//! This is intentionally not a generic queue: it carries only bytes and
//! leaves framing to the callers, which agree out-of-band on a fixed frame
//! size (channels x sample width). Partial writes/reads are not errors —
//! callers must check the returned count.

use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Lock-free SPSC byte ring buffer.
///
/// ## Thread Safety
///
/// The `write` cursor is stored only by the producer and the `read` cursor
/// only by the consumer; cursor publication uses Release stores paired with
/// Acquire loads of the opposite cursor. With exactly one producer thread and
/// one consumer thread this is race-free without locks.
///
/// Occupancy queries (`used_space`/`free_space`) are only approximately
/// consistent under concurrent access: each side sees its own cursor exactly
/// and the other side's conservatively. Overshoot/undershoot by a few bytes
/// is tolerated by the callers' frame budgeting.
pub struct PcmRingBuffer {
    data: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    /// Read cursor — written only by the consumer
    read: AtomicUsize,

    /// Write cursor — written only by the producer
    write: AtomicUsize,
}

// The UnsafeCell contents are only touched under the SPSC cursor discipline
// documented above.
unsafe impl Send for PcmRingBuffer {}
unsafe impl Sync for PcmRingBuffer {}

impl PcmRingBuffer {
    /// Create a ring buffer holding up to `capacity_bytes - 1` bytes.
    ///
    /// # Errors
    /// `Error::Allocation` if the backing storage cannot be allocated, or
    /// `Error::Config` for a capacity too small to hold a single frame.
    pub fn new(capacity_bytes: usize) -> Result<Self> {
        if capacity_bytes < 2 {
            return Err(Error::Config(format!(
                "ring buffer capacity {} is too small",
                capacity_bytes
            )));
        }

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(capacity_bytes)
            .map_err(|_| Error::Allocation(format!("ring buffer of {} bytes", capacity_bytes)))?;
        storage.resize_with(capacity_bytes, || UnsafeCell::new(0));

        debug!("Created PCM ring buffer: {} bytes", capacity_bytes);

        Ok(Self {
            data: storage.into_boxed_slice(),
            capacity: capacity_bytes,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        })
    }

    /// Total capacity in bytes (one byte is always reserved).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn used_space(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        w.wrapping_sub(r).wrapping_add(self.capacity) % self.capacity
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn free_space(&self) -> usize {
        self.capacity - self.used_space() - 1
    }

    /// Append bytes; never blocks, truncates to free space.
    ///
    /// Returns the number of bytes accepted. Producer-side only.
    pub fn write(&self, src: &[u8]) -> usize {
        let w = self.write.load(Ordering::Relaxed);
        let r = self.read.load(Ordering::Acquire);

        let used = w.wrapping_sub(r).wrapping_add(self.capacity) % self.capacity;
        let free = self.capacity - used - 1;
        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        let tail = self.capacity - w;
        let n1 = n.min(tail);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data[w].get(), n1);
            if n > n1 {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(n1), self.data[0].get(), n - n1);
            }
        }

        self.write.store((w + n) % self.capacity, Ordering::Release);
        n
    }

    /// Drain up to `dst.len()` bytes; never blocks, truncates to used space.
    ///
    /// Returns the number of bytes copied out. Consumer-side only.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let r = self.read.load(Ordering::Relaxed);
        let w = self.write.load(Ordering::Acquire);

        let used = w.wrapping_sub(r).wrapping_add(self.capacity) % self.capacity;
        let n = dst.len().min(used);
        if n == 0 {
            return 0;
        }

        let tail = self.capacity - r;
        let n1 = n.min(tail);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data[r].get(), dst.as_mut_ptr(), n1);
            if n > n1 {
                std::ptr::copy_nonoverlapping(self.data[0].get(), dst.as_mut_ptr().add(n1), n - n1);
            }
        }

        self.read.store((r + n) % self.capacity, Ordering::Release);
        n
    }

    /// Reset both cursors to zero without touching contents.
    ///
    /// Not safe under concurrent use; callers must quiesce the producer and
    /// consumer first (the state machine only clears between sessions).
    pub fn clear(&self) {
        self.read.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }
}
