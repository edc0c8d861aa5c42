use crate::resilience::{BiasTracker, ResilienceCalculator, ResilienceEvent};
use crate::series::{AggregationPolicy, AggregationWindow, StudyPoint, StudySeries};
use crate::vpin::VpinCalculator;
use marketbus::{BusError, MarketDataBus, MulticastRing, OrderBookSnapshot, Subscription, Trade};
use parking_lot::Mutex;
use std::sync::Arc;

/// The study capability: consume snapshots and trades, emit series points.
///
/// Calculators stay plain structs with no knowledge of the bus; a study is
/// the thin adapter that turns calculator output into [`StudyPoint`]s.
pub trait Study: Send {
    fn name(&self) -> &str;

    fn on_snapshot(&mut self, snap: &OrderBookSnapshot) -> Vec<StudyPoint>;

    fn on_trade(&mut self, trade: &Trade) -> Vec<StudyPoint>;

    /// Aggregation behaviour for this study's output stream.
    fn aggregation(&self) -> (AggregationWindow, AggregationPolicy) {
        (AggregationWindow::None, AggregationPolicy::Last)
    }
}

/// Market-resilience score study.
pub struct ResilienceStudy {
    calc: ResilienceCalculator,
    window: AggregationWindow,
}

impl ResilienceStudy {
    pub fn new(calc: ResilienceCalculator, window: AggregationWindow) -> Self {
        Self { calc, window }
    }
}

impl Study for ResilienceStudy {
    fn name(&self) -> &str {
        "market-resilience"
    }

    fn on_snapshot(&mut self, snap: &OrderBookSnapshot) -> Vec<StudyPoint> {
        score_point(self.calc.on_snapshot(snap))
    }

    fn on_trade(&mut self, trade: &Trade) -> Vec<StudyPoint> {
        score_point(self.calc.on_trade(trade))
    }

    fn aggregation(&self) -> (AggregationWindow, AggregationPolicy) {
        (self.window, AggregationPolicy::Last)
    }
}

fn score_point(event: Option<ResilienceEvent>) -> Vec<StudyPoint> {
    event
        .map(|event| {
            StudyPoint::new(event.timestamp, event.score)
                .with_mid(event.mid_price)
                .with_format("0.00")
        })
        .into_iter()
        .collect()
}

/// Directional bias study layered on the resilience calculator.
pub struct BiasStudy {
    calc: ResilienceCalculator,
    tracker: BiasTracker,
    window: AggregationWindow,
}

impl BiasStudy {
    pub fn new(calc: ResilienceCalculator, window: AggregationWindow) -> Self {
        Self {
            calc,
            tracker: BiasTracker::new(),
            window,
        }
    }
}

impl Study for BiasStudy {
    fn name(&self) -> &str {
        "market-resilience-bias"
    }

    fn on_snapshot(&mut self, snap: &OrderBookSnapshot) -> Vec<StudyPoint> {
        let event = self.calc.on_snapshot(snap);
        self.bias_point(event)
    }

    fn on_trade(&mut self, trade: &Trade) -> Vec<StudyPoint> {
        let event = self.calc.on_trade(trade);
        self.bias_point(event)
    }

    fn aggregation(&self) -> (AggregationWindow, AggregationPolicy) {
        (self.window, AggregationPolicy::Last)
    }
}

impl BiasStudy {
    fn bias_point(&mut self, event: Option<ResilienceEvent>) -> Vec<StudyPoint> {
        event
            .map(|event| {
                let bias = self.tracker.on_resilience(&event);
                StudyPoint::new(bias.timestamp, f64::from(bias.bias.value()))
                    .with_mid(bias.mid_price)
                    .with_color(match bias.bias.value() {
                        1 => "green",
                        -1 => "red",
                        _ => "gray",
                    })
            })
            .into_iter()
            .collect()
    }
}

/// VPIN study: volume buckets force new series points at every boundary.
pub struct VpinStudy {
    calc: VpinCalculator,
    window: AggregationWindow,
}

impl VpinStudy {
    pub fn new(calc: VpinCalculator, window: AggregationWindow) -> Self {
        Self { calc, window }
    }
}

impl Study for VpinStudy {
    fn name(&self) -> &str {
        "vpin"
    }

    fn on_snapshot(&mut self, snap: &OrderBookSnapshot) -> Vec<StudyPoint> {
        if let Some(mid) = snap.mid_price() {
            self.calc.set_mid(mid);
        }
        Vec::new()
    }

    fn on_trade(&mut self, trade: &Trade) -> Vec<StudyPoint> {
        let mid = self.calc.mid();
        self.calc
            .on_trade(trade)
            .into_iter()
            .map(|reading| {
                StudyPoint::new(trade.timestamp, reading.vpin)
                    .with_mid(mid)
                    .with_format("0.00%")
                    .with_new_bucket(reading.is_new_bucket)
            })
            .collect()
    }

    fn aggregation(&self) -> (AggregationWindow, AggregationPolicy) {
        (self.window, AggregationPolicy::PassthroughNewBucket)
    }
}

/// A study wired to the bus: both feeds for one (provider, symbol) are
/// serialised through one mutex, and every aggregated point is broadcast
/// on the series ring.
pub struct RunningStudy {
    name: String,
    series: Arc<Mutex<StudySeries>>,
    _book_sub: Subscription,
    _trade_sub: Subscription,
}

impl RunningStudy {
    /// Subscribes `study` to `bus` for one provider/symbol pair.
    ///
    /// The subscription names are derived from the study name, so two
    /// instances of one study on one bus need distinct study names.
    pub fn spawn<S: Study + 'static>(
        bus: &MarketDataBus,
        series_ring: Arc<MulticastRing<StudyPoint>>,
        provider_id: u32,
        symbol: &str,
        study: S,
    ) -> Result<Self, BusError> {
        let name = study.name().to_string();
        let (window, policy) = study.aggregation();
        let series = Arc::new(Mutex::new(StudySeries::new(window, policy)));
        // One mutex over (study, series): the joint trade/book order seen
        // by the calculator is exactly the lock-acquisition order.
        let shared = Arc::new(Mutex::new(study));

        let book_state = Arc::clone(&shared);
        let book_series = Arc::clone(&series);
        let book_ring = Arc::clone(&series_ring);
        let book_symbol = symbol.to_string();
        let book_sub = bus.subscribe_snapshots(&format!("{name}:{symbol}:books"), move |snap| {
            if snap.provider_id() != provider_id || snap.symbol() != book_symbol {
                return;
            }
            let points = book_state.lock().on_snapshot(snap);
            publish_points(&book_series, &book_ring, points);
        })?;

        let trade_state = Arc::clone(&shared);
        let trade_series = Arc::clone(&series);
        let trade_ring = Arc::clone(&series_ring);
        let trade_symbol = symbol.to_string();
        let trade_sub = bus.subscribe_trades(&format!("{name}:{symbol}:trades"), move |trade| {
            if trade.provider_id != provider_id || trade.symbol != trade_symbol {
                return;
            }
            let points = trade_state.lock().on_trade(trade);
            publish_points(&trade_series, &trade_ring, points);
        })?;

        Ok(Self {
            name,
            series,
            _book_sub: book_sub,
            _trade_sub: trade_sub,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Materialised output series (aggregated points, newest last).
    pub fn points(&self) -> Vec<StudyPoint> {
        self.series.lock().points().to_vec()
    }
}

fn publish_points(
    series: &Arc<Mutex<StudySeries>>,
    ring: &Arc<MulticastRing<StudyPoint>>,
    points: Vec<StudyPoint>,
) {
    for point in points {
        let aggregated = series.lock().push(point);
        ring.publish(aggregated.into_point());
    }
}
