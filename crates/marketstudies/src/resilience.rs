use crate::stats::{P2Quantile, RobustScale, RollingWindow};
use chrono::{DateTime, Duration, Utc};
use marketbus::{Level, OrderBookSnapshot, Trade};

/// Guard denominator for flat-book MADs and degenerate spreads.
const EPS: f64 = 1e-9;

/// One side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// A two-bit side set used for depletion bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SideSet {
    bid: bool,
    ask: bool,
}

impl SideSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, side: Side) {
        match side {
            Side::Bid => self.bid = true,
            Side::Ask => self.ask = true,
        }
    }

    pub fn contains(self, side: Side) -> bool {
        match side {
            Side::Bid => self.bid,
            Side::Ask => self.ask,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.bid && !self.ask
    }

    /// The sole member, when exactly one side is set.
    pub fn single(self) -> Option<Side> {
        match (self.bid, self.ask) {
            (true, false) => Some(Side::Bid),
            (false, true) => Some(Side::Ask),
            _ => None,
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Side> {
        [
            self.bid.then_some(Side::Bid),
            self.ask.then_some(Side::Ask),
        ]
        .into_iter()
        .flatten()
    }
}

/// Tuning for the resilience calculator.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Observation count kept per rolling window.
    pub window: usize,
    /// Hard lifetime of a trade-shock anchor; everything hanging off it is
    /// abandoned at expiry.
    pub shock_timeout: Duration,
    /// Sigma multiple for trade and spread shocks.
    pub sigma_threshold: f64,
    /// Robust z-drop required to flag a side depleted.
    pub depletion_z: f64,
    /// Fraction of the baseline-trough gap that counts as recovered.
    pub recovery_target: f64,
    /// Observations required before any shock can fire.
    pub min_samples: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            window: 500,
            shock_timeout: Duration::milliseconds(800),
            sigma_threshold: 2.0,
            depletion_z: 3.0,
            recovery_target: 0.9,
            min_samples: 3,
        }
    }
}

/// Size-weighted depth where each level is attenuated by `1 / (1 + d)^2`,
/// `d` being its distance from the best price in baseline-spread units.
/// An empty side has zero immediacy depth.
pub fn immediacy_weighted_depth(levels: &[Level], baseline_spread: f64) -> f64 {
    let Some(best) = levels.first() else {
        return 0.0;
    };
    let unit = baseline_spread.max(EPS);
    levels
        .iter()
        .map(|level| {
            let d = (level.price - best.price).abs() / unit;
            level.size / ((1.0 + d) * (1.0 + d))
        })
        .sum()
}

/// Component scores that contributed to an emission; absent components had
/// no evidence and were excluded from the weighting.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreComponents {
    pub trade_severity: Option<f64>,
    pub spread_recovery: Option<f64>,
    pub depth_recovery: Option<f64>,
    pub spread_magnitude: Option<f64>,
}

/// A completed shock/recovery cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceEvent {
    pub timestamp: DateTime<Utc>,
    /// Market-resilience score in [0, 1]; higher is a faster, cleaner
    /// recovery.
    pub score: f64,
    pub components: ScoreComponents,
    /// Sides flagged depleted during the cycle.
    pub depleted: SideSet,
    /// Side(s) whose depth recovered first (timeout winners included).
    pub first_recovered: SideSet,
    /// Aggressor side inferred for the triggering trade.
    pub shock_side: Option<Side>,
    pub mid_price: Option<f64>,
}

#[derive(Debug)]
struct TradeShock {
    t0: DateTime<Utc>,
    z: f64,
    side: Option<Side>,
}

#[derive(Debug)]
struct SpreadShock {
    t0: DateTime<Utc>,
    shock_spread: f64,
    recovered_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DepthResolution {
    Recovered { sides: SideSet, duration_ms: i64 },
    TimedOut { winner: SideSet },
}

#[derive(Debug)]
struct DepthEvent {
    t0: DateTime<Utc>,
    deadline: DateTime<Utc>,
    depleted: SideSet,
    baseline_bid: f64,
    baseline_ask: f64,
    trough_bid: f64,
    trough_ask: f64,
    last_bid: f64,
    last_ask: f64,
    resolution: Option<DepthResolution>,
}

impl DepthEvent {
    fn baseline(&self, side: Side) -> f64 {
        match side {
            Side::Bid => self.baseline_bid,
            Side::Ask => self.baseline_ask,
        }
    }

    fn trough(&self, side: Side) -> f64 {
        match side {
            Side::Bid => self.trough_bid,
            Side::Ask => self.trough_ask,
        }
    }

    /// Recovered fraction of the baseline-trough gap, clamped to [0, 1].
    fn recovery_fraction(&self, side: Side, current: f64) -> f64 {
        let gap = self.baseline(side) - self.trough(side);
        if gap <= 0.0 {
            return 0.0;
        }
        ((current - self.trough(side)) / gap).clamp(0.0, 1.0)
    }

    /// Timeout election: the depleted side that came closest to its
    /// recovery target; a tie elects both sides.
    fn elect_winner(&self) -> SideSet {
        let mut winner = SideSet::empty();
        let mut best = f64::MIN;
        for side in self.depleted.iter() {
            let current = match side {
                Side::Bid => self.last_bid,
                Side::Ask => self.last_ask,
            };
            let fraction = self.recovery_fraction(side, current);
            if fraction > best + EPS {
                winner = SideSet::empty();
                winner.insert(side);
                best = fraction;
            } else if (fraction - best).abs() <= EPS {
                winner.insert(side);
            }
        }
        winner
    }
}

/// Stateful market-resilience calculator for one (provider, symbol) pair.
///
/// Consumes the joint trade/book stream (callers serialise the two under a
/// single mutex) and emits a score whenever a shock cycle completes with at
/// least one real recovery. Shock anchors expire after
/// [`ResilienceConfig::shock_timeout`] and clear transitively; a timed-out
/// cycle emits nothing and leaves the history windows untouched.
#[derive(Debug)]
pub struct ResilienceCalculator {
    config: ResilienceConfig,

    trade_sizes: RollingWindow,
    spreads: RollingWindow,
    spread_recovery_hist: RollingWindow,
    depth_recovery_hist: RollingWindow,

    spread_median: P2Quantile,
    depth_bid: RobustScale,
    depth_ask: RobustScale,

    last_mid: Option<f64>,
    trade_shock: Option<TradeShock>,
    spread_shock: Option<SpreadShock>,
    depth_event: Option<DepthEvent>,
    /// Sides reported depleted on the previous update (edge triggering).
    last_reported_depletion: SideSet,
}

impl ResilienceCalculator {
    pub fn new(config: ResilienceConfig) -> Self {
        let window = config.window;
        Self {
            config,
            trade_sizes: RollingWindow::new(window),
            spreads: RollingWindow::new(window),
            spread_recovery_hist: RollingWindow::new(window),
            depth_recovery_hist: RollingWindow::new(window),
            spread_median: P2Quantile::median(),
            depth_bid: RobustScale::new(),
            depth_ask: RobustScale::new(),
            last_mid: None,
            trade_shock: None,
            spread_shock: None,
            depth_event: None,
            last_reported_depletion: SideSet::empty(),
        }
    }

    pub fn last_mid(&self) -> Option<f64> {
        self.last_mid
    }

    /// True while a trade-shock anchor is live.
    pub fn shock_active(&self) -> bool {
        self.trade_shock.is_some()
    }

    /// Feeds one trade. Normally this only maintains statistics and
    /// possibly latches a new anchor, but a trade that closes an expired
    /// shock window can flush a pending emission.
    pub fn on_trade(&mut self, trade: &Trade) -> Option<ResilienceEvent> {
        let flushed = self.expire_anchors(trade.timestamp);

        // Detection runs against the pre-trade window so the outlier does
        // not dilute its own threshold.
        if self.trade_shock.is_none() && self.trade_sizes.len() >= self.config.min_samples {
            if let (Some(mean), Some(sd)) = (self.trade_sizes.mean(), self.trade_sizes.std_dev()) {
                if trade.size > mean + self.config.sigma_threshold * sd {
                    let z = (trade.size - mean) / sd.max(EPS);
                    let side = self.last_mid.and_then(|mid| {
                        if trade.price > mid {
                            Some(Side::Ask)
                        } else if trade.price < mid {
                            Some(Side::Bid)
                        } else {
                            None
                        }
                    });
                    tracing::debug!(size = trade.size, z, ?side, "trade shock latched");
                    self.trade_shock = Some(TradeShock {
                        t0: trade.timestamp,
                        z,
                        side,
                    });
                }
            }
        }

        self.trade_sizes.push(trade.size);
        flushed
    }

    /// Feeds one book snapshot; returns a score when this update completes
    /// a shock cycle.
    pub fn on_snapshot(&mut self, snap: &OrderBookSnapshot) -> Option<ResilienceEvent> {
        // Cleanup books carry no update time and no levels; they cannot
        // advance the state machine.
        let ts = snap.last_updated()?;
        let flushed = self.expire_anchors(ts);

        if let Some(mid) = snap.mid_price() {
            self.last_mid = Some(mid);
        }

        self.update_spread_state(snap, ts);
        self.update_depth_state(snap, ts);
        if flushed.is_some() {
            return flushed;
        }
        self.maybe_emit(ts, snap.mid_price())
    }

    /// Sides newly flagged depleted by the most recent snapshot. Exposed
    /// for edge-trigger observability; [`on_snapshot`] already applies it.
    pub fn last_reported_depletion(&self) -> SideSet {
        self.last_reported_depletion
    }

    // ---------------------------------------------------------------------
    // STATE TRANSITIONS
    // ---------------------------------------------------------------------

    /// Closes the shock window once the trade anchor expires.
    ///
    /// A pending depth event is resolved by timeout election first; if the
    /// window saw at least one real recovery the cycle still emits,
    /// otherwise everything is abandoned silently.
    fn expire_anchors(&mut self, now: DateTime<Utc>) -> Option<ResilienceEvent> {
        let expired = self
            .trade_shock
            .as_ref()
            .is_some_and(|s| now.signed_duration_since(s.t0) > self.config.shock_timeout);
        if !expired {
            return None;
        }

        if let Some(event) = &mut self.depth_event {
            if event.resolution.is_none() {
                event.resolution = Some(DepthResolution::TimedOut {
                    winner: event.elect_winner(),
                });
            }
        }

        let emitted = self.emit(now, self.last_mid, true);
        if emitted.is_none() {
            tracing::debug!("trade shock window expired; abandoning partial shocks");
            self.trade_shock = None;
            self.spread_shock = None;
            self.depth_event = None;
        }
        emitted
    }

    fn update_spread_state(&mut self, snap: &OrderBookSnapshot, ts: DateTime<Utc>) {
        let Some(spread) = snap.spread() else {
            return;
        };

        if let Some(shock) = &mut self.spread_shock {
            if shock.recovered_ms.is_none() {
                if let Some(mean) = self.spreads.mean() {
                    if spread < mean {
                        shock.recovered_ms =
                            Some(ts.signed_duration_since(shock.t0).num_milliseconds());
                    }
                }
            }
        } else if self.trade_shock.is_some() && self.spreads.len() >= self.config.min_samples {
            // A spread shock only means something inside a trade window.
            if let (Some(mean), Some(sd)) = (self.spreads.mean(), self.spreads.std_dev()) {
                if spread > mean + self.config.sigma_threshold * sd {
                    tracing::debug!(spread, mean, "spread shock latched");
                    self.spread_shock = Some(SpreadShock {
                        t0: ts,
                        shock_spread: spread,
                        recovered_ms: None,
                    });
                }
            }
        }

        self.spreads.push(spread);
        self.spread_median.observe(spread);
    }

    fn update_depth_state(&mut self, snap: &OrderBookSnapshot, ts: DateTime<Utc>) {
        let baseline_spread = self
            .spread_median
            .value()
            .or_else(|| snap.spread())
            .unwrap_or(1.0);
        let bid_now = immediacy_weighted_depth(snap.bids(), baseline_spread);
        let ask_now = immediacy_weighted_depth(snap.asks(), baseline_spread);

        // Edge-triggered depletion: only transitions into the depleted
        // state are reported, not every tick the condition holds.
        let mut currently = SideSet::empty();
        if Self::is_depleted(&self.depth_bid, bid_now, self.config.depletion_z) {
            currently.insert(Side::Bid);
        }
        if Self::is_depleted(&self.depth_ask, ask_now, self.config.depletion_z) {
            currently.insert(Side::Ask);
        }
        let mut newly = SideSet::empty();
        for side in currently.iter() {
            if !self.last_reported_depletion.contains(side) {
                newly.insert(side);
            }
        }
        self.last_reported_depletion = currently;

        if !newly.is_empty() {
            if let Some(event) = &mut self.depth_event {
                if event.resolution.is_none() {
                    for side in newly.iter() {
                        event.depleted.insert(side);
                    }
                }
            } else {
                tracing::debug!(?newly, "depth event activated");
                self.depth_event = Some(DepthEvent {
                    t0: ts,
                    deadline: ts + self.config.shock_timeout,
                    depleted: newly,
                    baseline_bid: self.depth_bid.median().unwrap_or(bid_now),
                    baseline_ask: self.depth_ask.median().unwrap_or(ask_now),
                    trough_bid: bid_now,
                    trough_ask: ask_now,
                    last_bid: bid_now,
                    last_ask: ask_now,
                    resolution: None,
                });
            }
        }

        self.depth_bid.observe(bid_now);
        self.depth_ask.observe(ask_now);

        // Progress an active event: deepen troughs, then check the
        // recovery target and the deadline.
        if let Some(event) = &mut self.depth_event {
            if event.resolution.is_none() {
                event.trough_bid = event.trough_bid.min(bid_now);
                event.trough_ask = event.trough_ask.min(ask_now);
                event.last_bid = bid_now;
                event.last_ask = ask_now;

                let current = |side: Side| match side {
                    Side::Bid => bid_now,
                    Side::Ask => ask_now,
                };

                let mut recovered = SideSet::empty();
                for side in event.depleted.iter() {
                    if event.recovery_fraction(side, current(side)) >= self.config.recovery_target {
                        recovered.insert(side);
                    }
                }

                if !recovered.is_empty() {
                    let duration_ms = ts.signed_duration_since(event.t0).num_milliseconds();
                    tracing::debug!(?recovered, duration_ms, "depth recovered");
                    event.resolution = Some(DepthResolution::Recovered {
                        sides: recovered,
                        duration_ms,
                    });
                } else if ts >= event.deadline {
                    // Timed out: the closest side informs bias only - it is
                    // not a real recovery and appends no history.
                    event.resolution = Some(DepthResolution::TimedOut {
                        winner: event.elect_winner(),
                    });
                }
            }
        }
    }

    fn is_depleted(scale: &RobustScale, current: f64, z_threshold: f64) -> bool {
        let (Some(median), Some(mad)) = (scale.median(), scale.mad()) else {
            return false;
        };
        current < median && (median - current) / mad.max(EPS) >= z_threshold
    }

    // ---------------------------------------------------------------------
    // SCORING
    // ---------------------------------------------------------------------

    /// Emits once every triggered shock has resolved and at least one real
    /// recovery happened inside the trade window.
    fn maybe_emit(&mut self, ts: DateTime<Utc>, mid: Option<f64>) -> Option<ResilienceEvent> {
        self.emit(ts, mid, false)
    }

    fn emit(&mut self, ts: DateTime<Utc>, mid: Option<f64>, at_expiry: bool) -> Option<ResilienceEvent> {
        let trade = self.trade_shock.as_ref()?;

        // Before expiry, wait for every triggered shock to resolve so one
        // emission covers the whole cycle.
        let spread_pending = self
            .spread_shock
            .as_ref()
            .is_some_and(|s| s.recovered_ms.is_none());
        let depth_pending = self
            .depth_event
            .as_ref()
            .is_some_and(|d| d.resolution.is_none());
        if !at_expiry && (spread_pending || depth_pending) {
            return None;
        }

        let spread_recovered = self.spread_shock.as_ref().and_then(|s| s.recovered_ms);
        let depth_recovered = self.depth_event.as_ref().and_then(|d| match d.resolution {
            Some(DepthResolution::Recovered { sides, duration_ms }) => Some((sides, duration_ms)),
            _ => None,
        });
        if spread_recovered.is_none() && depth_recovered.is_none() {
            return None;
        }

        let mut numerator = 0.0;
        let mut weight_sum = 0.0;
        let mut components = ScoreComponents::default();

        // Trade severity, weight 0.30.
        let severity = (1.0 - trade.z / 6.0).max(0.0);
        components.trade_severity = Some(severity);
        numerator += 0.30 * severity;
        weight_sum += 0.30;

        // Spread recovery speed, weight 0.10. A first-ever recovery has no
        // history to compare against and scores fully, then seeds it.
        if let Some(ms) = spread_recovered {
            let score = match self.spread_recovery_hist.mean() {
                Some(avg) => avg / (avg + ms as f64).max(EPS),
                None => 1.0,
            };
            components.spread_recovery = Some(score);
            numerator += 0.10 * score;
            weight_sum += 0.10;
            self.spread_recovery_hist.push(ms as f64);
        }

        // Depth recovery speed, weight 0.50.
        if let Some((_, ms)) = depth_recovered {
            let score = match self.depth_recovery_hist.mean() {
                Some(avg) => avg / (avg + ms as f64).max(EPS),
                None => 1.0,
            };
            components.depth_recovery = Some(score);
            numerator += 0.50 * score;
            weight_sum += 0.50;
            self.depth_recovery_hist.push(ms as f64);
        }

        // Spread shock magnitude, weight 0.10.
        if let Some(shock) = &self.spread_shock {
            if let Some(avg) = self.spreads.mean() {
                let score = (avg / shock.shock_spread.max(EPS)).clamp(0.0, 1.0);
                components.spread_magnitude = Some(score);
                numerator += 0.10 * score;
                weight_sum += 0.10;
            }
        }

        let score = (numerator / weight_sum).clamp(0.0, 1.0);

        let depleted = self.depth_event.as_ref().map_or_else(SideSet::empty, |d| d.depleted);
        let first_recovered = self.depth_event.as_ref().map_or_else(SideSet::empty, |d| {
            match d.resolution {
                Some(DepthResolution::Recovered { sides, .. }) => sides,
                Some(DepthResolution::TimedOut { winner }) => winner,
                None => SideSet::empty(),
            }
        });
        let shock_side = trade.side;

        // The whole shock set resets after emission; the depletion edge
        // state is left alone so a still-depleted side does not re-edge.
        self.trade_shock = None;
        self.spread_shock = None;
        self.depth_event = None;

        tracing::debug!(score, ?depleted, ?first_recovered, "resilience score emitted");
        Some(ResilienceEvent {
            timestamp: ts,
            score,
            components,
            depleted,
            first_recovered,
            shock_side,
            mid_price: mid,
        })
    }
}

/// Directional read of a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Bearish = -1,
    Neutral = 0,
    Bullish = 1,
}

impl Bias {
    pub fn value(self) -> i8 {
        self as i8
    }
}

/// Bias output: the directional classification plus the fragility regime.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasEvent {
    pub timestamp: DateTime<Utc>,
    pub bias: Bias,
    /// True while resilience sits in the weak regime (entered at score
    /// <= 0.30, left at score >= 0.50).
    pub fragile: bool,
    pub score: f64,
    pub mid_price: Option<f64>,
}

/// Classifies completed cycles into bullish / bearish / neutral.
///
/// A one-sided ask depletion that recovers reads bullish (buyers consumed
/// the offer and the book refilled); a bid depletion reads bearish. When
/// both sides depleted, the side that recovered first decides. The
/// fragility flag is hysteretic on the resilience score.
#[derive(Debug)]
pub struct BiasTracker {
    arm_below: f64,
    disarm_above: f64,
    fragile: bool,
}

impl BiasTracker {
    pub fn new() -> Self {
        Self {
            arm_below: 0.30,
            disarm_above: 0.50,
            fragile: false,
        }
    }

    pub fn is_fragile(&self) -> bool {
        self.fragile
    }

    pub fn on_resilience(&mut self, event: &ResilienceEvent) -> BiasEvent {
        if !self.fragile && event.score <= self.arm_below {
            self.fragile = true;
        } else if self.fragile && event.score >= self.disarm_above {
            self.fragile = false;
        }

        let bias = match event.depleted.single() {
            Some(Side::Ask) => Bias::Bullish,
            Some(Side::Bid) => Bias::Bearish,
            None if event.depleted.is_empty() => Bias::Neutral,
            // Both sides depleted: first recovery decides.
            None => match event.first_recovered.single() {
                Some(Side::Bid) => Bias::Bullish,
                Some(Side::Ask) => Bias::Bearish,
                None => Bias::Neutral,
            },
        };

        BiasEvent {
            timestamp: event.timestamp,
            bias,
            fragile: self.fragile,
            score: event.score,
            mid_price: event.mid_price,
        }
    }
}

impl Default for BiasTracker {
    fn default() -> Self {
        Self::new()
    }
}
