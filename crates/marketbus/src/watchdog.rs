use crate::bus::MarketDataBus;
use crate::snapshot::{OrderBook, OrderBookSnapshot};
use crate::{ProviderStatus, Trade, WatchdogConfig};
use crate::Notification;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Registry view of one market-data provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEntry {
    pub provider_id: u32,
    pub name: String,
    pub status: ProviderStatus,
    pub last_updated: Option<DateTime<Utc>>,
    /// Symbols ever seen from this provider.
    pub symbols: BTreeSet<String>,
    /// Set and cleared only by the watchdog sweep.
    pub stale: bool,
}

/// Concurrent provider/symbol registry.
///
/// The bus records liveness on every publish; the watchdog is the sole
/// writer of the stale flag.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    inner: RwLock<HashMap<u32, ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts provider metadata and symbol membership from a book update.
    pub fn record_book(&self, book: &OrderBook) {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(book.provider_id)
            .or_insert_with(|| ProviderEntry {
                provider_id: book.provider_id,
                name: book.provider_name.clone(),
                status: book.provider_status,
                last_updated: None,
                symbols: BTreeSet::new(),
                stale: false,
            });
        entry.status = book.provider_status;
        entry.last_updated = book.last_updated;
        entry.symbols.insert(book.symbol.clone());
    }

    /// Marks provider liveness from a trade.
    pub fn record_trade(&self, trade: &Trade) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(&trade.provider_id) {
            entry.last_updated = Some(trade.timestamp);
        }
    }

    /// Overrides a provider's lifecycle status (connector-driven).
    pub fn set_status(&self, provider_id: u32, status: ProviderStatus) {
        if let Some(entry) = self.inner.write().get_mut(&provider_id) {
            entry.status = status;
        }
    }

    pub fn get(&self, provider_id: u32) -> Option<ProviderEntry> {
        self.inner.read().get(&provider_id).cloned()
    }

    pub fn entries(&self) -> Vec<ProviderEntry> {
        self.inner.read().values().cloned().collect()
    }

    pub fn is_stale(&self, provider_id: u32) -> bool {
        self.inner
            .read()
            .get(&provider_id)
            .is_some_and(|e| e.stale)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    fn apply_stale(&self, provider_id: u32) {
        if let Some(entry) = self.inner.write().get_mut(&provider_id) {
            entry.stale = true;
            entry.status = ProviderStatus::ConnectedWithWarnings;
        }
    }

    fn apply_recovered(&self, provider_id: u32) {
        if let Some(entry) = self.inner.write().get_mut(&provider_id) {
            entry.stale = false;
        }
    }
}

/// Heartbeat watchdog for stale providers.
///
/// Every sweep walks the registry: providers whose `last_updated` exceeds
/// the staleness threshold get exactly one transition per episode:
/// warning status, a notification, and one empty cleanup book per known
/// symbol so downstream views clear. A fresh update observed on a later
/// sweep ends the episode.
pub struct Watchdog {
    bus: Arc<MarketDataBus>,
    config: WatchdogConfig,
    notices: Sender<Notification>,
}

impl Watchdog {
    /// Creates a watchdog and the receiving end of its notification channel.
    pub fn new(bus: Arc<MarketDataBus>, config: WatchdogConfig) -> (Self, Receiver<Notification>) {
        let (tx, rx) = bounded(64);
        (
            Self {
                bus,
                config,
                notices: tx,
            },
            rx,
        )
    }

    /// Runs one sweep against an explicit clock. Returns the number of
    /// stale transitions performed (tests drive this directly).
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let staleness =
            chrono::Duration::milliseconds(self.config.staleness.as_millis() as i64);
        let registry = self.bus.providers();

        let mut went_stale = Vec::new();
        let mut recovered = Vec::new();
        for entry in registry.entries() {
            if entry.status.is_disconnected() {
                continue;
            }
            let Some(ts) = entry.last_updated else {
                continue;
            };
            let is_old = now.signed_duration_since(ts) > staleness;
            if is_old && !entry.stale {
                went_stale.push(entry);
            } else if !is_old && entry.stale {
                recovered.push(entry);
            }
        }

        for entry in &went_stale {
            registry.apply_stale(entry.provider_id);
            tracing::warn!(
                provider = %entry.name,
                provider_id = entry.provider_id,
                last_updated = ?entry.last_updated,
                "provider went stale; publishing cleanup books"
            );
            let _ = self.notices.try_send(Notification::ProviderStale {
                provider_id: entry.provider_id,
                provider_name: entry.name.clone(),
                last_updated: entry.last_updated,
            });
            for symbol in &entry.symbols {
                let snap = OrderBookSnapshot::empty(
                    symbol.clone(),
                    entry.provider_id,
                    entry.name.clone(),
                    self.bus.pool(),
                );
                self.bus.publish_cleanup(snap);
            }
        }

        for entry in &recovered {
            registry.apply_recovered(entry.provider_id);
            tracing::info!(
                provider = %entry.name,
                provider_id = entry.provider_id,
                "stale provider recovered"
            );
        }

        went_stale.len()
    }

    /// Spawns the periodic sweep thread.
    pub fn spawn(self) -> WatchdogHandle {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_worker = Arc::clone(&stop);
        let interval = self.config.interval;
        let handle = thread::Builder::new()
            .name("bus-watchdog".to_string())
            .spawn(move || {
                let (lock, cv) = &*stop_worker;
                let mut stopped = lock.lock();
                loop {
                    if *stopped {
                        break;
                    }
                    cv.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    self.sweep_at(Utc::now());
                }
            })
            .expect("spawning watchdog thread");
        WatchdogHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Join handle for the watchdog thread; stops it on drop.
pub struct WatchdogHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        let (lock, cv) = &*self.stop;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusConfig;
    use chrono::Duration as ChronoDuration;

    fn bus_with_provider(last_updated: DateTime<Utc>) -> Arc<MarketDataBus> {
        let bus = MarketDataBus::new(BusConfig::default()).unwrap();
        for symbol in ["BTC-USD", "ETH-USD"] {
            let mut book = OrderBook::new(symbol, 1, "feed-a");
            book.last_updated = Some(last_updated);
            book.upsert_bid(100.0, 1.0, 1);
            book.upsert_ask(100.5, 1.0, 2);
            let _ = bus.publish_book(&book);
        }
        bus
    }

    #[test]
    fn stale_transition_is_edge_triggered() {
        let now = Utc::now();
        let bus = bus_with_provider(now - ChronoDuration::seconds(31));
        let published_before = bus.total_published();
        let (watchdog, notices) = Watchdog::new(Arc::clone(&bus), WatchdogConfig::default());

        assert_eq!(watchdog.sweep_at(now), 1);
        assert!(bus.providers().is_stale(1));
        assert_eq!(
            bus.providers().get(1).unwrap().status,
            ProviderStatus::ConnectedWithWarnings
        );
        // One notification, one empty book per known symbol.
        assert_eq!(notices.try_iter().count(), 1);
        assert_eq!(bus.total_published(), published_before + 2);

        // Still stale on the next sweep: no re-emission.
        assert_eq!(watchdog.sweep_at(now), 0);
        assert_eq!(notices.try_iter().count(), 0);
        assert_eq!(bus.total_published(), published_before + 2);
    }

    #[test]
    fn fresh_update_clears_stale_flag_quietly() {
        let now = Utc::now();
        let bus = bus_with_provider(now - ChronoDuration::seconds(31));
        let (watchdog, notices) = Watchdog::new(Arc::clone(&bus), WatchdogConfig::default());
        watchdog.sweep_at(now);
        let _ = notices.try_iter().count();

        // Provider resumes.
        let mut book = OrderBook::new("BTC-USD", 1, "feed-a");
        book.last_updated = Some(now);
        let _ = bus.publish_book(&book);
        let published_before = bus.total_published();

        assert_eq!(watchdog.sweep_at(now), 0);
        assert!(!bus.providers().is_stale(1));
        assert_eq!(notices.try_iter().count(), 0);
        assert_eq!(bus.total_published(), published_before);
    }

    #[test]
    fn cleanup_books_are_empty_and_flagged() {
        let now = Utc::now();
        let bus = bus_with_provider(now - ChronoDuration::seconds(31));
        let sub_probe: Arc<Mutex<Vec<(String, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::clone(&sub_probe);
        let _sub = bus
            .subscribe_snapshots("probe", move |snap| {
                probe.lock().push((
                    snap.symbol().to_string(),
                    snap.bids().len(),
                    snap.asks().len(),
                ));
            })
            .unwrap();

        let (watchdog, _notices) = Watchdog::new(Arc::clone(&bus), WatchdogConfig::default());
        watchdog.sweep_at(now);

        // Wait for the dispatch thread to drain both cleanup books.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while sub_probe.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let seen = sub_probe.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, bids, asks)| *bids == 0 && *asks == 0));
    }

    #[test]
    fn disconnected_providers_are_left_alone() {
        let now = Utc::now();
        let bus = bus_with_provider(now - ChronoDuration::seconds(120));
        bus.providers().set_status(1, ProviderStatus::DisconnectedFailed);
        let (watchdog, notices) = Watchdog::new(Arc::clone(&bus), WatchdogConfig::default());

        assert_eq!(watchdog.sweep_at(now), 0);
        assert!(!bus.providers().is_stale(1));
        assert_eq!(notices.try_iter().count(), 0);
    }
}
