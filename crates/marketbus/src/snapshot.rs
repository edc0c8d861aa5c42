use crate::pool::{ArrayPool, PooledBuf};
use crate::ProviderStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One price level of an immutable snapshot.
///
/// `cumulative_size` is the running total from the best price down to and
/// including this level; `entry_id` is an opaque venue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
    pub is_bid: bool,
    pub cumulative_size: f64,
    pub entry_id: u64,
}

/// One price level of the mutable book model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub price: f64,
    pub size: f64,
    pub entry_id: u64,
}

/// The mutable legacy order-book model.
///
/// Connectors assemble updates here, then freeze them with
/// [`snapshot`](Self::snapshot) before publication. This is the only model
/// that can be written to; the snapshot side has no mutating API at all.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub symbol: String,
    pub provider_id: u32,
    pub provider_name: String,
    pub provider_status: ProviderStatus,
    pub sequence: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub bids: Vec<BookEntry>,
    pub asks: Vec<BookEntry>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, provider_id: u32, provider_name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            provider_id,
            provider_name: provider_name.into(),
            provider_status: ProviderStatus::Connected,
            sequence: 0,
            last_updated: None,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Inserts or replaces a bid level; zero size deletes it.
    pub fn upsert_bid(&mut self, price: f64, size: f64, entry_id: u64) {
        Self::upsert(&mut self.bids, price, size, entry_id);
        self.bids
            .sort_unstable_by(|a, b| b.price.total_cmp(&a.price));
    }

    /// Inserts or replaces an ask level; zero size deletes it.
    pub fn upsert_ask(&mut self, price: f64, size: f64, entry_id: u64) {
        Self::upsert(&mut self.asks, price, size, entry_id);
        self.asks
            .sort_unstable_by(|a, b| a.price.total_cmp(&b.price));
    }

    fn upsert(side: &mut Vec<BookEntry>, price: f64, size: f64, entry_id: u64) {
        side.retain(|l| l.price != price);
        if size > 0.0 {
            side.push(BookEntry {
                price,
                size,
                entry_id,
            });
        }
    }

    /// Removes every level from both sides.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Freezes the current state into an immutable snapshot backed by
    /// pool-rented level storage. Bids come out strictly descending, asks
    /// strictly ascending, with cumulative sizes filled in.
    pub fn snapshot(&self, pool: &Arc<ArrayPool<Level>>) -> OrderBookSnapshot {
        let mut bids = self.bids.clone();
        bids.sort_unstable_by(|a, b| b.price.total_cmp(&a.price));
        let mut asks = self.asks.clone();
        asks.sort_unstable_by(|a, b| a.price.total_cmp(&b.price));

        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            provider_id: self.provider_id,
            provider_name: self.provider_name.clone(),
            provider_status: self.provider_status,
            sequence: self.sequence,
            last_updated: self.last_updated,
            bids: freeze_side(pool, &bids, true),
            asks: freeze_side(pool, &asks, false),
        }
    }
}

fn freeze_side(pool: &Arc<ArrayPool<Level>>, entries: &[BookEntry], is_bid: bool) -> PooledBuf<Level> {
    let mut side = pool.rent(entries.len());
    let mut cumulative = 0.0;
    for entry in entries {
        cumulative += entry.size;
        side.push(Level {
            price: entry.price,
            size: entry.size,
            is_bid,
            cumulative_size: cumulative,
            entry_id: entry.entry_id,
        });
    }
    side
}

/// An immutable, pool-backed order-book snapshot.
///
/// Fields are fixed at construction and the type exposes no mutating
/// methods, so a shared `Arc<OrderBookSnapshot>` can cross threads freely.
/// Dropping the snapshot returns the level storage to its pool; consumers
/// that need to edit call [`to_mutable`](Self::to_mutable) for an
/// independently owned copy.
#[derive(Debug, PartialEq)]
pub struct OrderBookSnapshot {
    symbol: String,
    provider_id: u32,
    provider_name: String,
    provider_status: ProviderStatus,
    sequence: u64,
    last_updated: Option<DateTime<Utc>>,
    bids: PooledBuf<Level>,
    asks: PooledBuf<Level>,
}

impl OrderBookSnapshot {
    /// An empty book for one symbol, used by the stale-provider cleanup
    /// path: both sides empty, warning status, no update time.
    pub fn empty(
        symbol: impl Into<String>,
        provider_id: u32,
        provider_name: impl Into<String>,
        pool: &Arc<ArrayPool<Level>>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            provider_id,
            provider_name: provider_name.into(),
            provider_status: ProviderStatus::ConnectedWithWarnings,
            sequence: 0,
            last_updated: None,
            bids: pool.rent(0),
            asks: pool.rent(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn provider_id(&self) -> u32 {
        self.provider_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn provider_status(&self) -> ProviderStatus {
        self.provider_status
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Bid levels, strictly descending by price.
    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    /// Ask levels, strictly ascending by price.
    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    /// Midpoint of the touch, when both sides are populated.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    /// Touch spread, when both sides are populated.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    }

    pub fn total_bid_volume(&self) -> f64 {
        self.bids.iter().map(|l| l.size).sum()
    }

    pub fn total_ask_volume(&self) -> f64 {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// True when the book violates `best_bid < best_ask`. Normal feeds
    /// never produce this; tests use it as an observable corruption probe.
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(b), Some(a)) if b.price >= a.price
        )
    }

    /// Copies this snapshot into an independently owned mutable book.
    pub fn to_mutable(&self) -> OrderBook {
        let strip = |levels: &[Level]| {
            levels
                .iter()
                .map(|l| BookEntry {
                    price: l.price,
                    size: l.size,
                    entry_id: l.entry_id,
                })
                .collect()
        };
        OrderBook {
            symbol: self.symbol.clone(),
            provider_id: self.provider_id,
            provider_name: self.provider_name.clone(),
            provider_status: self.provider_status,
            sequence: self.sequence,
            last_updated: self.last_updated,
            bids: strip(&self.bids),
            asks: strip(&self.asks),
        }
    }
}
