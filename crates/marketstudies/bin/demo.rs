//! End-to-end demo: a synthetic connector feeding the bus, three studies
//! consuming it, and a tap printing what lands on the series rings.
//!
//! ```sh
//! RUST_LOG=info cargo run --bin demo
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use marketbus::{
    BusConfig, MarketDataBus, MulticastRing, OrderBook, Trade, TradeSide, Watchdog, WatchdogConfig,
};
use marketstudies::{
    AggregationWindow, BiasStudy, ResilienceCalculator, ResilienceConfig, ResilienceStudy,
    RunningStudy, StudyPoint, VpinCalculator, VpinConfig, VpinStudy,
};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SYMBOL: &str = "BTC-USD";
const PROVIDER: u32 = 1;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus = MarketDataBus::new(BusConfig::default()).expect("bus construction");
    let (watchdog, notices) = Watchdog::new(Arc::clone(&bus), WatchdogConfig::default());
    let _watchdog = watchdog.spawn();

    let resilience_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(4096).expect("ring"));
    let bias_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(4096).expect("ring"));
    let vpin_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(4096).expect("ring"));

    let resilience = RunningStudy::spawn(
        &bus,
        Arc::clone(&resilience_ring),
        PROVIDER,
        SYMBOL,
        ResilienceStudy::new(
            ResilienceCalculator::new(ResilienceConfig::default()),
            AggregationWindow::Ms100,
        ),
    )
    .expect("resilience study");
    let bias = RunningStudy::spawn(
        &bus,
        Arc::clone(&bias_ring),
        PROVIDER,
        SYMBOL,
        BiasStudy::new(
            ResilienceCalculator::new(ResilienceConfig::default()),
            AggregationWindow::Ms100,
        ),
    )
    .expect("bias study");
    let vpin = RunningStudy::spawn(
        &bus,
        Arc::clone(&vpin_ring),
        PROVIDER,
        SYMBOL,
        VpinStudy::new(
            VpinCalculator::new(&VpinConfig { bucket_volume: 50.0 }),
            AggregationWindow::Ms500,
        ),
    )
    .expect("vpin study");

    tracing::info!("publishing synthetic feed");
    run_feed(&bus);

    // Give the dispatch threads a moment to drain.
    thread::sleep(Duration::from_millis(300));

    for (study, ring) in [
        (&resilience, &resilience_ring),
        (&bias, &bias_ring),
        (&vpin, &vpin_ring),
    ] {
        let points = study.points();
        tracing::info!(
            study = study.name(),
            points = points.len(),
            last = ?points.last().map(|p| p.value),
            ring_published = ring.total_published(),
            "study output"
        );
    }
    for notice in notices.try_iter() {
        tracing::warn!(?notice, "watchdog notification");
    }
    let metrics = bus.book_metrics();
    tracing::info!(
        published = metrics.total_published,
        consumers = metrics.consumers.len(),
        "book ring metrics"
    );
}

/// Random-walk books and trades with an injected liquidity shock.
fn run_feed(bus: &MarketDataBus) {
    let mut rng = rand::thread_rng();
    let start = Utc::now();
    let mut mid = 100.0;

    for i in 0..3000i64 {
        let ts = start + ChronoDuration::milliseconds(i * 2);
        mid += rng.gen_range(-0.01..0.01);

        // Shock window: a burst of outsized buying and a thinned ask side.
        let shocked = (1500..1520).contains(&i);
        let ask_size = if shocked { 0.4 } else { 8.0 };

        let mut book = OrderBook::new(SYMBOL, PROVIDER, "demo-feed");
        book.sequence = i as u64;
        book.last_updated = Some(ts);
        for level in 0..5u64 {
            let offset = 0.05 + level as f64 * 0.05;
            book.upsert_bid(mid - offset, 8.0, level);
            book.upsert_ask(mid + offset, ask_size, 100 + level);
        }
        let _ = bus.publish_book(&book);

        let size = if shocked {
            rng.gen_range(4.0..6.0)
        } else {
            rng.gen_range(0.5..1.5)
        };
        let side = if rng.gen_bool(if shocked { 0.9 } else { 0.5 }) {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        let price = match side {
            TradeSide::Buy => mid + 0.05,
            TradeSide::Sell => mid - 0.05,
        };
        let _ = bus.publish_trade(Trade::new(SYMBOL, PROVIDER, ts, price, size, Some(side)));

        if i % 64 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
