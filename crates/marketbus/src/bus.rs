use crate::multicast::{Cursor, CursorState, MulticastRing, RingMetrics};
use crate::pool::ArrayPool;
use crate::snapshot::{Level, OrderBook, OrderBookSnapshot};
use crate::watchdog::ProviderRegistry;
use crate::{BusConfig, BusError, Trade};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Application-scoped market-data façade.
///
/// Owns the order-book ring and the trade ring, the provider/symbol
/// registry, and the master emission flag. Constructed explicitly and
/// passed by reference - tests build private instances and call
/// [`reset`](Self::reset) instead of sharing process-wide state.
pub struct MarketDataBus {
    books: Arc<MulticastRing<OrderBookSnapshot>>,
    trades: Arc<MulticastRing<Trade>>,
    pool: Arc<ArrayPool<Level>>,
    providers: Arc<ProviderRegistry>,
    total_published: AtomicU64,
    emission_enabled: AtomicBool,
    snapshot_subscribers: Arc<AtomicUsize>,
    copy_subscribers: Arc<AtomicUsize>,
    trade_subscribers: Arc<AtomicUsize>,
    config: BusConfig,
}

impl MarketDataBus {
    pub fn new(config: BusConfig) -> Result<Arc<Self>, BusError> {
        config.validate()?;
        Ok(Arc::new(Self {
            books: Arc::new(MulticastRing::with_capacity(config.book_capacity)?),
            trades: Arc::new(MulticastRing::with_capacity(config.trade_capacity)?),
            pool: ArrayPool::new(),
            providers: Arc::new(ProviderRegistry::new()),
            total_published: AtomicU64::new(0),
            emission_enabled: AtomicBool::new(true),
            snapshot_subscribers: Arc::new(AtomicUsize::new(0)),
            copy_subscribers: Arc::new(AtomicUsize::new(0)),
            trade_subscribers: Arc::new(AtomicUsize::new(0)),
            config,
        }))
    }

    /// The level-storage pool shared by every snapshot on this bus.
    pub fn pool(&self) -> &Arc<ArrayPool<Level>> {
        &self.pool
    }

    /// Provider/symbol registry, also read by the heartbeat watchdog.
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Master flag: while clear, every connector publish is dropped.
    pub fn set_emission_enabled(&self, enabled: bool) {
        self.emission_enabled.store(enabled, Ordering::Release);
    }

    pub fn emission_enabled(&self) -> bool {
        self.emission_enabled.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE
    // ---------------------------------------------------------------------

    /// Freezes `book` into a pooled snapshot and broadcasts it.
    ///
    /// Returns the assigned sequence, or `None` when the master emission
    /// flag is off. Also keeps the provider registry current (name, status,
    /// symbol set, `last_updated`).
    pub fn publish_book(&self, book: &OrderBook) -> Option<u64> {
        if !self.emission_enabled() {
            return None;
        }
        self.providers.record_book(book);
        let snap = book.snapshot(&self.pool);
        self.total_published.fetch_add(1, Ordering::Relaxed);
        Some(self.books.publish(snap))
    }

    /// Broadcasts a trade. Same gating and registry upkeep as
    /// [`publish_book`](Self::publish_book).
    pub fn publish_trade(&self, trade: Trade) -> Option<u64> {
        if !self.emission_enabled() {
            return None;
        }
        self.providers.record_trade(&trade);
        self.total_published.fetch_add(1, Ordering::Relaxed);
        Some(self.trades.publish(trade))
    }

    /// Watchdog-only path: broadcasts a cleanup snapshot without touching
    /// the registry and regardless of the emission flag.
    pub(crate) fn publish_cleanup(&self, snap: OrderBookSnapshot) -> u64 {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        self.books.publish(snap)
    }

    // ---------------------------------------------------------------------
    // CONSUMER SIDE
    // ---------------------------------------------------------------------

    /// Zero-copy subscription: the callback borrows the shared snapshot.
    pub fn subscribe_snapshots<F>(&self, name: &str, mut callback: F) -> Result<Subscription, BusError>
    where
        F: FnMut(&OrderBookSnapshot) + Send + 'static,
    {
        let cursor = self.books.subscribe(name)?;
        self.snapshot_subscribers.fetch_add(1, Ordering::AcqRel);
        Ok(spawn_worker(
            Arc::clone(&self.books),
            cursor,
            &self.config,
            counter_guard(&self.snapshot_subscribers),
            move |snap: Arc<OrderBookSnapshot>| callback(&snap),
        ))
    }

    /// Legacy-copy subscription: the callback receives an independently
    /// owned mutable book, synthesised at dispatch time.
    pub fn subscribe_books<F>(&self, name: &str, mut callback: F) -> Result<Subscription, BusError>
    where
        F: FnMut(OrderBook) + Send + 'static,
    {
        let cursor = self.books.subscribe(name)?;
        self.copy_subscribers.fetch_add(1, Ordering::AcqRel);
        Ok(spawn_worker(
            Arc::clone(&self.books),
            cursor,
            &self.config,
            counter_guard(&self.copy_subscribers),
            move |snap: Arc<OrderBookSnapshot>| callback(snap.to_mutable()),
        ))
    }

    /// Trade-stream subscription.
    pub fn subscribe_trades<F>(&self, name: &str, mut callback: F) -> Result<Subscription, BusError>
    where
        F: FnMut(&Trade) + Send + 'static,
    {
        let cursor = self.trades.subscribe(name)?;
        self.trade_subscribers.fetch_add(1, Ordering::AcqRel);
        Ok(spawn_worker(
            Arc::clone(&self.trades),
            cursor,
            &self.config,
            counter_guard(&self.trade_subscribers),
            move |trade: Arc<Trade>| callback(&trade),
        ))
    }

    // ---------------------------------------------------------------------
    // OBSERVABILITY & LIFECYCLE
    // ---------------------------------------------------------------------

    pub fn book_metrics(&self) -> RingMetrics {
        self.books.metrics()
    }

    pub fn trade_metrics(&self) -> RingMetrics {
        self.trades.metrics()
    }

    /// Messages accepted across both rings since construction or reset.
    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }

    pub fn snapshot_subscriber_count(&self) -> usize {
        self.snapshot_subscribers.load(Ordering::Acquire)
    }

    pub fn copy_subscriber_count(&self) -> usize {
        self.copy_subscribers.load(Ordering::Acquire)
    }

    pub fn trade_subscriber_count(&self) -> usize {
        self.trade_subscribers.load(Ordering::Acquire)
    }

    /// Test-support reset: cancels every consumer, empties both rings and
    /// zeroes all counters and registries.
    pub fn reset(&self) {
        self.books.reset();
        self.trades.reset();
        self.providers.clear();
        self.total_published.store(0, Ordering::Release);
        self.emission_enabled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MarketDataBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataBus")
            .field("total_published", &self.total_published())
            .field("snapshot_subscribers", &self.snapshot_subscriber_count())
            .field("copy_subscribers", &self.copy_subscriber_count())
            .field("trade_subscribers", &self.trade_subscriber_count())
            .finish()
    }
}

fn counter_guard(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    // Saturating decrement: a reset may have zeroed the counter while
    // subscription handles were still alive.
    let counter = Arc::clone(counter);
    move || {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Wait strategy for an empty cursor, escalating spin -> yield -> park.
///
/// A consumer that just missed a read burns a few PAUSE hints first (the
/// producer is usually mid-publish), yields the core for a while after
/// that, and finally parks on the ring's condition variable until
/// `publish` signals it - the park timeout doubles as the safety net for
/// a notification raced away by the waiter handshake.
struct DispatchWait {
    empty_reads: u32,
    park_timeout: Duration,
}

impl DispatchWait {
    /// Empty reads spent spinning before yielding.
    const SPIN_READS: u32 = 16;
    /// Further empty reads spent yielding before parking.
    const YIELD_READS: u32 = 8;

    fn new(park_timeout: Duration) -> Self {
        Self {
            empty_reads: 0,
            park_timeout,
        }
    }

    /// Called after every empty `try_read`.
    fn idle<T>(&mut self, ring: &MulticastRing<T>, cursor: &Cursor) {
        self.empty_reads += 1;
        if self.empty_reads <= Self::SPIN_READS {
            std::hint::spin_loop();
        } else if self.empty_reads <= Self::SPIN_READS + Self::YIELD_READS {
            thread::yield_now();
        } else {
            ring.wait(cursor, self.park_timeout);
            self.empty_reads = 0;
        }
    }

    /// Rearms the escalation after a delivered message.
    fn delivered(&mut self) {
        self.empty_reads = 0;
    }
}

/// Spawns the per-consumer dispatch thread.
///
/// Callback panics are logged and skipped; the cursor advances regardless,
/// so one poisoned message cannot wedge a consumer.
fn spawn_worker<T, F>(
    ring: Arc<MulticastRing<T>>,
    cursor: Cursor,
    config: &BusConfig,
    on_exit: impl FnOnce() + Send + 'static,
    mut deliver: F,
) -> Subscription
where
    T: Send + Sync + 'static,
    F: FnMut(Arc<T>) + Send + 'static,
{
    let state = Arc::clone(cursor.state());
    let name = state.name().to_string();
    let park_timeout = config.park_timeout;
    let thread_name = format!("bus-{name}");

    let worker_ring = Arc::clone(&ring);
    let worker_name = name.clone();
    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut wait = DispatchWait::new(park_timeout);
            loop {
                if cursor.state().is_cancelled() {
                    break;
                }
                match worker_ring.try_read(&cursor) {
                    Some((msg, seq)) => {
                        wait.delivered();
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| deliver(msg))) {
                            tracing::error!(
                                consumer = %worker_name,
                                seq,
                                ?payload,
                                "consumer callback panicked; cursor advances"
                            );
                        }
                    }
                    None => wait.idle(&worker_ring, &cursor),
                }
            }
            worker_ring.unsubscribe(&worker_name);
            on_exit();
        })
        .expect("spawning consumer thread");

    Subscription {
        name,
        state,
        ring_waker: Box::new(move || ring.wake_all()),
        handle: Some(handle),
        grace: config.shutdown_grace,
    }
}

/// Handle for one dispatch-loop consumer.
///
/// Dropping (or calling [`stop`](Self::stop)) requests cooperative
/// cancellation, wakes the worker if parked, and waits up to the configured
/// grace period for it to exit before detaching.
pub struct Subscription {
    name: String,
    state: Arc<CursorState>,
    ring_waker: Box<dyn Fn() + Send + Sync>,
    handle: Option<JoinHandle<()>>,
    grace: Duration,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cursor counters for this consumer.
    pub fn cursor(&self) -> &Arc<CursorState> {
        &self.state
    }

    /// Stops the consumer and waits for its thread within the grace period.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.state.cancel();
        (self.ring_waker)();
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + self.grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!(consumer = %self.name, "consumer ignored cancellation; detaching");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_wait_escalates_then_parks_and_rearms() {
        let ring = MulticastRing::<u64>::with_capacity(8).unwrap();
        let cursor = ring.subscribe("idle").unwrap();
        let mut wait = DispatchWait::new(Duration::from_millis(5));

        let cheap_reads = DispatchWait::SPIN_READS + DispatchWait::YIELD_READS;
        for _ in 0..cheap_reads {
            wait.idle(&ring, &cursor);
        }
        assert_eq!(wait.empty_reads, cheap_reads);

        // The next empty read parks on the ring (bounded by the timeout)
        // and rearms the escalation.
        let started = Instant::now();
        wait.idle(&ring, &cursor);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(wait.empty_reads, 0);

        wait.idle(&ring, &cursor);
        assert_eq!(wait.empty_reads, 1);
        wait.delivered();
        assert_eq!(wait.empty_reads, 0);
    }
}
