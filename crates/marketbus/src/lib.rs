//! marketbus - lock-free SPMC multicast bus for market data.
//!
//! The data plane of a real-time microstructure analytics platform:
//! connectors publish immutable order-book snapshots and trades onto
//! fixed-capacity rings; any number of consumers read through private
//! cursors at their own pace. There is no backpressure by design - a
//! consumer that falls a full buffer behind loses the lapped range and the
//! loss is visible on its own counters, never on the producer.
//!
//! # Example
//!
//! ```
//! use marketbus::{BusConfig, MarketDataBus, OrderBook};
//!
//! let bus = MarketDataBus::new(BusConfig::default()).unwrap();
//! let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
//! let probe = std::sync::Arc::clone(&seen);
//!
//! let sub = bus
//!     .subscribe_snapshots("example", move |snap| {
//!         let _ = snap.mid_price();
//!         probe.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     })
//!     .unwrap();
//!
//! let mut book = OrderBook::new("BTC-USD", 1, "demo-feed");
//! book.upsert_bid(100.0, 2.0, 1);
//! book.upsert_ask(100.5, 1.0, 2);
//! let seq = bus.publish_book(&book);
//! assert_eq!(seq, Some(0));
//!
//! sub.stop();
//! ```

mod bus;
mod config;
mod error;
mod events;
mod invariants;
mod multicast;
mod pool;
mod reconnect;
mod snapshot;
mod watchdog;

pub use bus::{MarketDataBus, Subscription};
pub use config::{validate_capacity, BusConfig, WatchdogConfig};
pub use error::BusError;
pub use events::{MetricEvent, Notification, ProviderStatus, Trade, TradeSide};
pub use multicast::{
    ConsumerHealth, ConsumerMetrics, Cursor, CursorState, MulticastRing, RingMetrics,
};
pub use pool::{ArrayPool, PoolMetrics, PooledBuf};
pub use reconnect::{ConnectionState, ReconnectPolicy, Reconnector, RetryDecision};
pub use snapshot::{BookEntry, Level, OrderBook, OrderBookSnapshot};
pub use watchdog::{ProviderEntry, ProviderRegistry, Watchdog, WatchdogHandle};
