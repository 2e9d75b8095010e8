//! Bounded frame buffer between the producer and the worker pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::Frame;
use crate::error::{PipelineError, Result};

/// What `enqueue` does when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Suspend the producer until a worker frees a slot. Every frame is
    /// eventually processed.
    #[default]
    BlockProducer,
    /// Evict the oldest queued frame. The producer never waits.
    DropOldest,
}

/// Outcome of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Sequence number stamped on the accepted frame
    pub sequence: u64,
    /// Sequence number of the frame displaced to make room, if any
    pub evicted: Option<u64>,
}

/// Single-producer, multi-consumer frame queue with a fixed capacity.
///
/// Sequence numbers are handed out under the same lock that appends, so
/// queue order and sequence order always agree.
pub struct BoundedFrameBuffer<P> {
    state: Mutex<State<P>>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: BackpressurePolicy,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct State<P> {
    ring: HeapRb<Frame<P>>,
    next_sequence: u64,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_enqueued: AtomicU64,
    frames_dequeued: AtomicU64,
    frames_evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub evicted: u64,
}

impl<P> BoundedFrameBuffer<P> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "buffer capacity must be at least 1".into(),
            ));
        }

        Ok(Self {
            state: Mutex::new(State {
                ring: HeapRb::new(capacity),
                next_sequence: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy,
            capacity,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Producer: add a frame, applying the backpressure policy when full.
    pub fn enqueue(&self, mut frame: Frame<P>) -> Result<Enqueued> {
        let mut state = self.lock();
        if state.closed {
            return Err(PipelineError::InvalidState("enqueue after close"));
        }

        if self.policy == BackpressurePolicy::BlockProducer {
            while state.ring.is_full() {
                trace!("Buffer full, producer waiting");
                state = self
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    debug!("Buffer closed while producer was blocked");
                    return Err(PipelineError::Closed);
                }
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        frame.set_sequence(sequence);

        // Only reachable with a full ring under DropOldest.
        let displaced = state.ring.push_overwrite(frame);
        drop(state);
        self.not_empty.notify_one();

        self.stats.frames_enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framepipe_frames_enqueued_total").increment(1);

        let evicted = displaced.map(|old| {
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("framepipe_frames_evicted_total").increment(1);
            debug!(evicted = old.sequence(), sequence, "Dropped oldest frame");
            old.sequence()
        });

        Ok(Enqueued { sequence, evicted })
    }

    /// Consumer: block until a frame is available.
    ///
    /// Returns `None` once the buffer is closed and fully drained.
    pub fn dequeue(&self) -> Option<Frame<P>> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.ring.try_pop() {
                drop(state);
                self.not_full.notify_one();
                self.stats.frames_dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Consumer: take a frame if one is queued, without waiting.
    pub fn try_dequeue(&self) -> Option<Frame<P>> {
        let frame = self.lock().ring.try_pop()?;
        self.not_full.notify_one();
        self.stats.frames_dequeued.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Stop accepting frames. Queued frames still drain to consumers.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        debug!("Frame buffer closed");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            enqueued: self.stats.frames_enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.frames_dequeued.load(Ordering::Relaxed),
            evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
