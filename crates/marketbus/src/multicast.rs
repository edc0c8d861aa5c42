use crate::invariants::{
    debug_assert_cursor_bound, debug_assert_monotonic_count, debug_assert_read_in_window,
};
use crate::{validate_capacity, BusError};
use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// This SPMC multicast ring broadcasts every message to every registered
// consumer. One producer, any number of cursors, no backpressure: a consumer
// that falls more than `capacity` messages behind loses the lapped range and
// keeps going.
//
// ## Sequence numbers
//
// `published` counts messages ever published (u64, practically unwrappable).
// Message `k` (0-based) occupies slot `k & mask`. A cursor stores `next`,
// the sequence it will read next, so `published - next` is its lag.
//
// ## Publication protocol
//
// **Producer:**
// 1. `seq = published` (Relaxed - single writer)
// 2. Store `SlotEntry { seq, payload }` into `slots[seq & mask]`
//    (ArcSwapOption::store, release semantics)
// 3. Store `published = seq + 1` (Release - publishes step 2)
// 4. Wake parked consumers if any
//
// **Consumer:**
// 1. `p = published` (Acquire - synchronizes with step 3)
// 2. If lapped (`p - next > capacity`), charge the loss and jump to `p - N`
// 3. Load the slot (atomic Arc snapshot - never torn)
// 4. Verify the entry's own `seq` stamp equals `next`
//
// Step 4 is what makes lapping detection exact: if the producer overwrote
// the slot between steps 1 and 3, the stamp is `next + capacity` (or more)
// and the consumer re-runs the loss accounting instead of delivering a
// mislabelled message. The stamp can never be *older* than `next`: the
// Acquire in step 1 already proved the write for `next` happened.
//
// ## Slot reclamation
//
// Slots hold `Arc`s. Overwriting a slot drops the ring's reference; the
// payload is freed once the last consumer that cloned it lets go. There is
// no eager clearing on publish - exactly the slow path a broadcast bus
// wants to avoid.
//
// =============================================================================

/// A sequence-stamped slot entry.
///
/// The stamp travels with the payload so a reader can detect that a slot
/// was lapped between observing `published` and loading the slot.
struct SlotEntry<T> {
    seq: u64,
    payload: Arc<T>,
}

/// Shared per-consumer state.
///
/// The subscribing consumer owns the reading side through [`Cursor`]; the
/// ring keeps the `Arc` only for metrics and wake-ups.
#[derive(Debug)]
pub struct CursorState {
    name: String,
    /// Next sequence this consumer will read.
    next: AtomicU64,
    consumed: AtomicU64,
    lost: AtomicU64,
    cancelled: AtomicBool,
}

impl CursorState {
    fn new(name: String, next: u64) -> Self {
        Self {
            name,
            next: AtomicU64::new(next),
            consumed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Consumer name, unique per ring.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages delivered so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Messages lost to lapping so far.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Requests cooperative cancellation of the consumer loop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Reading handle for one consumer.
///
/// Reads are sequential; the handle is `Send` but not `Clone`, so exactly
/// one thread drives it.
#[derive(Debug)]
pub struct Cursor {
    state: Arc<CursorState>,
}

impl Cursor {
    /// Shared state, also held by the ring registry.
    pub fn state(&self) -> &Arc<CursorState> {
        &self.state
    }
}

/// Per-consumer lag classification surfaced by [`RingMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerHealth {
    /// Lag below half the buffer.
    Healthy,
    /// Lag at or above 50% of the buffer.
    Warning,
    /// Lag at or above 90% of the buffer; loss is imminent.
    Critical,
}

impl ConsumerHealth {
    fn classify(lag: u64, capacity: usize) -> Self {
        let cap = capacity as u64;
        if lag * 10 >= cap * 9 {
            Self::Critical
        } else if lag * 2 >= cap {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

/// Metrics snapshot for one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    pub name: String,
    /// Next sequence the consumer will read.
    pub position: u64,
    /// `published - position`.
    pub lag: u64,
    pub consumed: u64,
    pub lost: u64,
    pub health: ConsumerHealth,
}

/// Metrics snapshot for the whole ring.
#[derive(Debug, Clone)]
pub struct RingMetrics {
    pub buffer_size: usize,
    /// Sequence of the most recent publish; `None` before the first one.
    pub producer_sequence: Option<u64>,
    pub total_published: u64,
    pub consumers: Vec<ConsumerMetrics>,
}

/// Lock-free single-producer multicast ring.
///
/// Every published message is visible to every registered cursor. The
/// producer never blocks and never fails; slow consumers lose the lapped
/// range and record the loss on their own counters.
pub struct MulticastRing<T> {
    /// Count of messages ever published. Cache-padded: this is the only
    /// word the producer writes on the hot path and every consumer reads it.
    published: CachePadded<AtomicU64>,
    /// Serialises writers. The protocol is single-producer; connectors that
    /// share one bus contend here for nanoseconds instead of corrupting the
    /// sequence. Consumers never touch this lock.
    producer_lock: Mutex<()>,
    slots: Box<[ArcSwapOption<SlotEntry<T>>]>,
    mask: u64,
    consumers: RwLock<HashMap<String, Arc<CursorState>>>,
    /// Parking support: consumers that exhausted their spin budget wait
    /// here; `publish` notifies only when `waiters` is nonzero.
    park_lock: Mutex<()>,
    park_cv: Condvar,
    waiters: AtomicUsize,
}

impl<T> MulticastRing<T> {
    /// Creates a ring with the given power-of-two capacity.
    pub fn with_capacity(capacity: usize) -> Result<Self, BusError> {
        validate_capacity(capacity)?;
        let slots = (0..capacity).map(|_| ArcSwapOption::const_empty()).collect();
        Ok(Self {
            published: CachePadded::new(AtomicU64::new(0)),
            producer_lock: Mutex::new(()),
            slots,
            mask: capacity as u64 - 1,
            consumers: RwLock::new(HashMap::new()),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
            waiters: AtomicUsize::new(0),
        })
    }

    /// Ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Count of messages ever published.
    #[inline]
    pub fn total_published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Publishes a message, returning its sequence. Never blocks, never
    /// fails; overwrites the slot occupied `capacity` messages ago.
    pub fn publish(&self, msg: T) -> u64 {
        self.publish_shared(Arc::new(msg))
    }

    /// Publishes an already-shared message.
    pub fn publish_shared(&self, msg: Arc<T>) -> u64 {
        let guard = self.producer_lock.lock();
        let seq = self.published.load(Ordering::Relaxed);
        let idx = (seq & self.mask) as usize;
        self.slots[idx].store(Some(Arc::new(SlotEntry { seq, payload: msg })));

        debug_assert_monotonic_count!(seq, seq + 1);
        self.published.store(seq + 1, Ordering::Release);
        drop(guard);

        if self.waiters.load(Ordering::Acquire) > 0 {
            // Take and release the park lock so a consumer between its
            // published-check and its wait cannot miss this notification.
            drop(self.park_lock.lock());
            self.park_cv.notify_all();
        }
        seq
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Registers a consumer starting at the current head (no history replay).
    pub fn subscribe(&self, name: &str) -> Result<Cursor, BusError> {
        let mut consumers = self.consumers.write();
        if consumers.contains_key(name) {
            return Err(BusError::DuplicateConsumer {
                name: name.to_string(),
            });
        }
        let state = Arc::new(CursorState::new(
            name.to_string(),
            self.published.load(Ordering::Acquire),
        ));
        consumers.insert(name.to_string(), Arc::clone(&state));
        Ok(Cursor { state })
    }

    /// Removes a consumer by name. Returns whether it was registered.
    pub fn unsubscribe(&self, name: &str) -> bool {
        match self.consumers.write().remove(name) {
            Some(state) => {
                state.cancel();
                true
            }
            None => false,
        }
    }

    /// Attempts to read the next message for `cursor`.
    ///
    /// Returns the message and its sequence, or `None` when the consumer is
    /// caught up. A consumer that was lapped skips to the oldest live
    /// message and records the skipped count on `lost`.
    pub fn try_read(&self, cursor: &Cursor) -> Option<(Arc<T>, u64)> {
        let state = cursor.state.as_ref();
        loop {
            let p = self.published.load(Ordering::Acquire);
            let mut next = state.next.load(Ordering::Relaxed);
            debug_assert_cursor_bound!(next, p);
            if next >= p {
                return None;
            }

            let capacity = self.mask + 1;
            if p - next > capacity {
                // Lapped while idle: everything older than `p - N` is gone.
                let oldest = p - capacity;
                state.lost.fetch_add(oldest - next, Ordering::Relaxed);
                state.next.store(oldest, Ordering::Relaxed);
                next = oldest;
            }

            let Some(entry) = self.slots[(next & self.mask) as usize].load_full() else {
                // Slot cleared by a concurrent reset.
                return None;
            };
            if entry.seq == next {
                debug_assert_read_in_window!(next, p, capacity);
                state.next.store(next + 1, Ordering::Release);
                state.consumed.fetch_add(1, Ordering::Relaxed);
                return Some((Arc::clone(&entry.payload), next));
            }

            // The stamp is newer than `next`: the producer lapped us between
            // the published-load and the slot-load. Loop; the fresh count
            // will route us through the loss accounting above.
            debug_assert!(entry.seq > next, "slot stamp regressed");
        }
    }

    /// Parks the caller until something newer than `next` is published, the
    /// timeout elapses, or the cursor is cancelled. Returns `true` when new
    /// data may be available.
    pub fn wait(&self, cursor: &Cursor, timeout: Duration) -> bool {
        let state = cursor.state.as_ref();
        let next = state.next.load(Ordering::Relaxed);

        let mut guard = self.park_lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        // Re-check under the lock, after announcing ourselves: a publish
        // between the caller's failed try_read and this point must not be
        // slept through. The timed wait backstops the remaining window.
        if self.published.load(Ordering::SeqCst) > next || state.is_cancelled() {
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        self.park_cv.wait_for(&mut guard, timeout);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        self.published.load(Ordering::Acquire) > next
    }

    /// Wakes every parked consumer (used by cancellation and reset).
    pub fn wake_all(&self) {
        drop(self.park_lock.lock());
        self.park_cv.notify_all();
    }

    // ---------------------------------------------------------------------
    // OBSERVABILITY & LIFECYCLE
    // ---------------------------------------------------------------------

    /// Point-in-time metrics for the ring and every consumer.
    pub fn metrics(&self) -> RingMetrics {
        let published = self.published.load(Ordering::Acquire);
        let consumers = self
            .consumers
            .read()
            .values()
            .map(|state| {
                let position = state.next.load(Ordering::Relaxed);
                let lag = published.saturating_sub(position);
                ConsumerMetrics {
                    name: state.name.clone(),
                    position,
                    lag,
                    consumed: state.consumed(),
                    lost: state.lost(),
                    health: ConsumerHealth::classify(lag, self.capacity()),
                }
            })
            .collect();
        RingMetrics {
            buffer_size: self.capacity(),
            producer_sequence: published.checked_sub(1),
            total_published: published,
            consumers,
        }
    }

    /// Test-support reset: drops all consumers, zeroes the sequence and
    /// clears every slot.
    pub fn reset(&self) {
        let mut consumers = self.consumers.write();
        for state in consumers.values() {
            state.cancel();
        }
        consumers.clear();
        drop(consumers);

        self.published.store(0, Ordering::Release);
        for slot in self.slots.iter() {
            slot.store(None);
        }
        self.wake_all();
    }
}

impl<T> std::fmt::Debug for MulticastRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastRing")
            .field("capacity", &self.capacity())
            .field("published", &self.total_published())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_capacity() {
        assert!(matches!(
            MulticastRing::<u64>::with_capacity(100),
            Err(BusError::InvalidBufferSize { got: 100 })
        ));
        assert!(MulticastRing::<u64>::with_capacity(64).is_ok());
    }

    #[test]
    fn producer_sequence_tracks_publishes() {
        let ring = MulticastRing::with_capacity(16).unwrap();
        assert_eq!(ring.metrics().producer_sequence, None);

        for i in 0..5u64 {
            assert_eq!(ring.publish(i), i);
        }
        let m = ring.metrics();
        assert_eq!(m.producer_sequence, Some(4));
        assert_eq!(m.total_published, 5);
    }

    #[test]
    fn broadcast_reaches_every_consumer_in_order() {
        let ring = MulticastRing::with_capacity(64).unwrap();
        let cursors: Vec<_> = (0..3)
            .map(|i| ring.subscribe(&format!("c{i}")).unwrap())
            .collect();

        for i in 0..32u64 {
            ring.publish(i);
        }

        for cursor in &cursors {
            let mut expected = 0u64;
            while let Some((msg, seq)) = ring.try_read(cursor) {
                assert_eq!(*msg, expected);
                assert_eq!(seq, expected);
                expected += 1;
            }
            assert_eq!(expected, 32);
            assert_eq!(cursor.state().lost(), 0);
            assert_eq!(cursor.state().consumed(), 32);
        }
    }

    #[test]
    fn subscriber_starts_at_head_not_history() {
        let ring = MulticastRing::with_capacity(16).unwrap();
        ring.publish(1u64);
        ring.publish(2u64);

        let cursor = ring.subscribe("late").unwrap();
        assert!(ring.try_read(&cursor).is_none());

        ring.publish(3u64);
        let (msg, seq) = ring.try_read(&cursor).unwrap();
        assert_eq!(*msg, 3);
        assert_eq!(seq, 2);
    }

    #[test]
    fn lapped_consumer_skips_to_oldest_and_counts_loss() {
        const N: usize = 16;
        const M: u64 = 40;
        let ring = MulticastRing::with_capacity(N).unwrap();
        let cursor = ring.subscribe("slow").unwrap();

        for i in 0..M {
            ring.publish(i);
        }

        let mut read = Vec::new();
        while let Some((_, seq)) = ring.try_read(&cursor) {
            read.push(seq);
        }

        assert_eq!(read.len(), N);
        assert_eq!(read[0], M - N as u64);
        assert_eq!(*read.last().unwrap(), M - 1);
        assert_eq!(cursor.state().lost(), M - N as u64);
        assert_eq!(cursor.state().consumed(), N as u64);
    }

    #[test]
    fn duplicate_name_rejected_without_registry_change() {
        let ring = MulticastRing::<u64>::with_capacity(16).unwrap();
        let _first = ring.subscribe("dup").unwrap();
        assert_eq!(ring.consumer_count(), 1);

        let err = ring.subscribe("dup").unwrap_err();
        assert_eq!(
            err,
            BusError::DuplicateConsumer {
                name: "dup".to_string()
            }
        );
        assert_eq!(ring.consumer_count(), 1);
    }

    #[test]
    fn unsubscribe_removes_and_cancels() {
        let ring = MulticastRing::<u64>::with_capacity(16).unwrap();
        let cursor = ring.subscribe("gone").unwrap();
        assert!(ring.unsubscribe("gone"));
        assert!(!ring.unsubscribe("gone"));
        assert!(cursor.state().is_cancelled());
        assert_eq!(ring.consumer_count(), 0);
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(ConsumerHealth::classify(0, 100), ConsumerHealth::Healthy);
        assert_eq!(ConsumerHealth::classify(49, 100), ConsumerHealth::Healthy);
        assert_eq!(ConsumerHealth::classify(50, 100), ConsumerHealth::Warning);
        assert_eq!(ConsumerHealth::classify(89, 100), ConsumerHealth::Warning);
        assert_eq!(ConsumerHealth::classify(90, 100), ConsumerHealth::Critical);
    }

    #[test]
    fn reset_clears_everything() {
        let ring = MulticastRing::with_capacity(16).unwrap();
        let _cursor = ring.subscribe("a").unwrap();
        ring.publish(7u64);
        ring.reset();

        assert_eq!(ring.consumer_count(), 0);
        assert_eq!(ring.total_published(), 0);
        let cursor = ring.subscribe("b").unwrap();
        assert!(ring.try_read(&cursor).is_none());
    }
}
