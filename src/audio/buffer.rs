//! Fixed-capacity byte ring shared between the network producer and the
//! real-time render callback.
//!
//! The ring keeps a write offset (WO) and a read offset (RO), both in
//! `[0, capacity)`. Fresh data is the span from RO up to WO, wrapping around
//! the end of the storage when WO < RO. WO == RO means the ring is empty.
//!
//! Both sides hold the lock only for the duration of a `memcpy`, so the
//! render callback never waits behind anything slower than a copy.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Backlog (in multiples of the request) above which RO is nudged forward
const DRIFT_NUDGE_THRESHOLD: usize = 2;
/// Backlog (in multiples of the request) above which a whole request is skipped
const DRIFT_SKIP_THRESHOLD: usize = 4;
const DRIFT_NUDGE_FRACTION: f64 = 0.25;

struct RingState {
    data: Box<[u8]>,
    write_offset: usize,
    read_offset: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Distance from RO to WO, accounting for wrap
    fn fresh(&self) -> usize {
        if self.write_offset >= self.read_offset {
            self.write_offset - self.read_offset
        } else {
            self.capacity() - self.read_offset + self.write_offset
        }
    }
}

/// Result of a single [`RingBuffer::drain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The output was filled with buffered audio; `skipped` bytes were
    /// discarded afterwards by drift correction.
    Filled { skipped: usize },
    /// Not enough fresh bytes: the output was zero-filled and RO left alone.
    Underrun { available: usize },
}

/// Ring buffer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RingStats {
    pub capacity: usize,
    pub buffered: usize,
    pub overflows: usize,
    pub underruns: usize,
    pub drift_skips: usize,
    pub bytes_skipped: u64,
}

/// Mutex-guarded circular byte buffer
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
    drift_skip_count: AtomicUsize,
    bytes_skipped: AtomicU64,
}

impl RingBuffer {
    /// Create a zeroed ring of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "Ring capacity must be at least 2 bytes");

        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_offset: 0,
                read_offset: 0,
            }),
            capacity,
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
            drift_skip_count: AtomicUsize::new(0),
            bytes_skipped: AtomicU64::new(0),
        }
    }

    /// Copy `bytes` in at WO, wrapping at the end of the storage.
    ///
    /// Never blocks beyond contention with `drain`. If the write would run
    /// over unread data, the oldest unread bytes are dropped: RO is moved so
    /// the newest `capacity - 1` bytes remain readable. A slice of
    /// `capacity` bytes or more keeps only its tail.
    pub fn enqueue(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let cap = self.capacity;
        let mut src = bytes;
        let mut overflowed = false;
        if src.len() >= cap {
            src = &src[src.len() - (cap - 1)..];
            overflowed = true;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fresh_before = state.fresh();

        let wo = state.write_offset;
        let space_to_end = cap - wo;
        if src.len() < space_to_end {
            state.data[wo..wo + src.len()].copy_from_slice(src);
            state.write_offset = wo + src.len();
        } else {
            let (head, tail) = src.split_at(space_to_end);
            state.data[wo..].copy_from_slice(head);
            state.data[..tail.len()].copy_from_slice(tail);
            state.write_offset = tail.len();
        }
        state.write_offset %= cap;

        if overflowed || fresh_before + src.len() >= cap {
            state.read_offset = (state.write_offset + 1) % cap;
            drop(guard);
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(len = bytes.len(), "ring overflow, oldest audio dropped");
        }
    }

    /// Fill `out` completely, either with buffered audio or with silence.
    ///
    /// When the writer is ahead without wrap and the backlog is at least
    /// twice the request, RO is advanced by a further quarter request; at
    /// four times the request, by a further full request. Both nudges can
    /// apply on the same call.
    pub fn drain(&self, out: &mut [u8]) -> DrainOutcome {
        let requested = out.len();
        if requested == 0 {
            return DrainOutcome::Filled { skipped: 0 };
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cap = state.capacity();
        let fresh = state.fresh();

        if fresh < requested {
            drop(guard);
            out.fill(0);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
            return DrainOutcome::Underrun { available: fresh };
        }

        let ro = state.read_offset;
        let mut skipped = 0;

        if state.write_offset >= ro {
            out.copy_from_slice(&state.data[ro..ro + requested]);
            state.read_offset = ro + requested;

            if fresh >= DRIFT_NUDGE_THRESHOLD * requested {
                skipped += (DRIFT_NUDGE_FRACTION * requested as f64).round() as usize;
            }
            if fresh >= DRIFT_SKIP_THRESHOLD * requested {
                skipped += requested;
            }
            state.read_offset += skipped;
        } else {
            let space_to_end = cap - ro;
            if space_to_end >= requested {
                out.copy_from_slice(&state.data[ro..ro + requested]);
                state.read_offset = ro + requested;
            } else {
                let (head, tail) = out.split_at_mut(space_to_end);
                head.copy_from_slice(&state.data[ro..]);
                tail.copy_from_slice(&state.data[..requested - space_to_end]);
                state.read_offset = requested - space_to_end;
            }
        }
        state.read_offset %= cap;
        drop(guard);

        if skipped > 0 {
            self.drift_skip_count.fetch_add(1, Ordering::Relaxed);
            self.bytes_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        }
        DrainOutcome::Filled { skipped }
    }

    /// Fresh bytes waiting to be drained
    pub fn buffered(&self) -> usize {
        self.state.lock().fresh()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Drop everything buffered
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.write_offset = 0;
        state.read_offset = 0;
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity,
            buffered: self.buffered(),
            overflows: self.overflow_count(),
            underruns: self.underrun_count(),
            drift_skips: self.drift_skip_count.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
        }
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.buffered() as f32 / self.capacity as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
