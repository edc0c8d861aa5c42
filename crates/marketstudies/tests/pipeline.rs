//! End-to-end pipeline tests: connector → bus → study → series ring.

use chrono::{DateTime, TimeZone, Utc};
use marketbus::{BusConfig, MarketDataBus, MulticastRing, OrderBook, Trade, TradeSide};
use marketstudies::{
    AggregationWindow, ResilienceCalculator, ResilienceConfig, ResilienceStudy, RunningStudy,
    StudyPoint, VpinCalculator, VpinConfig, VpinStudy,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SYMBOL: &str = "BTC-USD";
const PROVIDER: u32 = 1;

fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

fn book_at(ms: i64, spread_ticks: f64, bid_size: f64, ask_size: f64) -> OrderBook {
    const TICK: f64 = 0.1;
    let mid = 100.0;
    let half = spread_ticks * TICK / 2.0;
    let mut book = OrderBook::new(SYMBOL, PROVIDER, "testfeed");
    book.last_updated = Some(at_ms(ms));
    for i in 0..3u64 {
        let offset = i as f64 * TICK;
        book.upsert_bid(mid - half - offset, bid_size, i);
        book.upsert_ask(mid + half + offset, ask_size, 10 + i);
    }
    book
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn vpin_study_emits_boundary_point_onto_series_ring() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let series_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(1024).unwrap());
    let tap = series_ring.subscribe("tap").unwrap();

    let study = RunningStudy::spawn(
        &bus,
        Arc::clone(&series_ring),
        PROVIDER,
        SYMBOL,
        VpinStudy::new(
            VpinCalculator::new(&VpinConfig {
                bucket_volume: 100.0,
            }),
            AggregationWindow::None,
        ),
    )
    .unwrap();

    let _ = bus.publish_book(&book_at(0, 1.0, 10.0, 10.0));
    // Let the book dispatch land first so every reading carries the mid.
    thread::sleep(Duration::from_millis(100));
    for i in 0..100i64 {
        let _ = bus.publish_trade(Trade::new(
            SYMBOL,
            PROVIDER,
            at_ms(10 + i),
            100.05,
            1.0,
            Some(TradeSide::Buy),
        ));
    }

    assert!(wait_until(Duration::from_secs(5), || study.points().len() == 100));

    let points = study.points();
    let boundary = points.last().unwrap();
    assert_eq!(boundary.value, 1.0);
    assert!(boundary.new_bucket);
    assert!(points[..99].iter().all(|p| !p.new_bucket && p.value == 1.0));
    assert_eq!(boundary.mid_price, Some(100.0));

    // Every aggregated point was also broadcast on the series ring.
    let mut broadcast = 0;
    while series_ring.try_read(&tap).is_some() {
        broadcast += 1;
    }
    assert_eq!(broadcast, 100);
}

#[test]
fn resilience_cycle_travels_through_the_bus() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let series_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(1024).unwrap());

    let study = RunningStudy::spawn(
        &bus,
        Arc::clone(&series_ring),
        PROVIDER,
        SYMBOL,
        ResilienceStudy::new(
            ResilienceCalculator::new(ResilienceConfig::default()),
            AggregationWindow::None,
        ),
    )
    .unwrap();

    // Warm-up: calm books and unit-ish trades. Event time is synthetic, so
    // wall-clock pauses below only order the two streams, not the clock.
    for i in 0..300i64 {
        let size = if i % 2 == 0 { 0.9 } else { 1.1 };
        let _ = bus.publish_trade(Trade::new(
            SYMBOL,
            PROVIDER,
            at_ms(-30_000 + i * 10),
            100.0,
            size,
            Some(TradeSide::Buy),
        ));
        let _ = bus.publish_book(&book_at(-30_000 + i * 10, 1.0, 10.0, 10.0));
    }
    thread::sleep(Duration::from_millis(200));

    // Outsized buy above mid, then stress, then recovery.
    let _ = bus.publish_trade(Trade::new(
        SYMBOL,
        PROVIDER,
        at_ms(0),
        100.06,
        5.0,
        Some(TradeSide::Buy),
    ));
    thread::sleep(Duration::from_millis(100));
    let _ = bus.publish_book(&book_at(150, 3.0, 10.0, 0.5));
    thread::sleep(Duration::from_millis(50));
    let _ = bus.publish_book(&book_at(300, 1.0, 10.0, 0.5));
    thread::sleep(Duration::from_millis(50));
    let _ = bus.publish_book(&book_at(400, 1.0, 10.0, 10.0));

    assert!(wait_until(Duration::from_secs(5), || !study.points().is_empty()));

    let points = study.points();
    assert_eq!(points.len(), 1);
    let score = points[0].value;
    assert!(score > 0.5 && score <= 1.0, "score {score}");
    assert_eq!(points[0].timestamp, at_ms(400));
}

#[test]
fn study_ignores_other_symbols_and_providers() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let series_ring = Arc::new(MulticastRing::<StudyPoint>::with_capacity(256).unwrap());

    let study = RunningStudy::spawn(
        &bus,
        Arc::clone(&series_ring),
        PROVIDER,
        SYMBOL,
        VpinStudy::new(
            VpinCalculator::new(&VpinConfig { bucket_volume: 10.0 }),
            AggregationWindow::None,
        ),
    )
    .unwrap();

    // Wrong symbol, then wrong provider: no output.
    let _ = bus.publish_trade(Trade::new(
        "ETH-USD",
        PROVIDER,
        at_ms(0),
        100.0,
        5.0,
        Some(TradeSide::Buy),
    ));
    let _ = bus.publish_trade(Trade::new(
        SYMBOL,
        99,
        at_ms(1),
        100.0,
        5.0,
        Some(TradeSide::Buy),
    ));
    // Matching stream produces a point.
    let _ = bus.publish_trade(Trade::new(
        SYMBOL,
        PROVIDER,
        at_ms(2),
        100.0,
        5.0,
        Some(TradeSide::Buy),
    ));

    assert!(wait_until(Duration::from_secs(5), || study.points().len() == 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(study.points().len(), 1);
}
