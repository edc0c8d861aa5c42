use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    /// Buyer initiated (lifted the offer).
    Buy,
    /// Seller initiated (hit the bid).
    Sell,
}

/// A canonical trade event produced by exchange connectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub provider_id: u32,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    /// `None` when the feed does not attribute the aggressor. Such trades
    /// are skipped by volume-classification studies but still timestamped.
    pub side: Option<TradeSide>,
}

impl Trade {
    pub fn new(
        symbol: impl Into<String>,
        provider_id: u32,
        timestamp: DateTime<Utc>,
        price: f64,
        size: f64,
        side: Option<TradeSide>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            provider_id,
            timestamp,
            price,
            size,
            side,
        }
    }
}

/// Lifecycle status of a market-data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderStatus {
    Connecting,
    Connected,
    ConnectedWithWarnings,
    Disconnected,
    /// Reconnection attempts exhausted; no further cleanup is performed.
    DisconnectedFailed,
}

impl ProviderStatus {
    /// True for states the heartbeat watchdog must leave alone.
    pub fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected | Self::DisconnectedFailed)
    }
}

/// Typed output record consumed by the external trigger-rule evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub plugin: String,
    pub metric: String,
    pub exchange: String,
    pub symbol: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Durable conditions surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A provider stopped sending updates past the staleness threshold.
    ProviderStale {
        provider_id: u32,
        provider_name: String,
        last_updated: Option<DateTime<Utc>>,
    },
    /// A connector gave up reconnecting.
    ReconnectionExhausted { provider_id: u32, attempts: u32 },
}
