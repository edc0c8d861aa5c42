use marketbus::{BusConfig, BusError, MarketDataBus, MulticastRing, OrderBook, Trade, TradeSide};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn concurrent_publish_and_drain_in_order() {
    const M: u64 = 10_000;
    let ring = Arc::new(MulticastRing::with_capacity(16_384).unwrap());
    let cursor = ring.subscribe("drain").unwrap();

    let producer_ring = Arc::clone(&ring);
    let producer = thread::spawn(move || {
        for i in 0..M {
            producer_ring.publish(i);
        }
    });

    let mut expected = 0u64;
    let deadline = Instant::now() + Duration::from_secs(10);
    while expected < M {
        assert!(Instant::now() < deadline, "drain stalled at {expected}");
        if let Some((msg, seq)) = ring.try_read(&cursor) {
            assert_eq!(*msg, expected);
            assert_eq!(seq, expected);
            expected += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    producer.join().unwrap();
    assert_eq!(cursor.state().lost(), 0);
    assert_eq!(cursor.state().consumed(), M);
}

#[test]
fn three_consumers_each_see_all_messages() {
    const M: u64 = 500;
    let ring = Arc::new(MulticastRing::with_capacity(1024).unwrap());
    let cursors: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|n| ring.subscribe(n).unwrap())
        .collect();

    for i in 0..M {
        ring.publish(i);
    }

    for cursor in &cursors {
        let mut next = 0u64;
        while let Some((msg, _)) = ring.try_read(cursor) {
            assert_eq!(*msg, next);
            next += 1;
        }
        assert_eq!(next, M);
        assert_eq!(cursor.state().lost(), 0);
    }
}

#[test]
fn parked_consumer_wakes_on_publish() {
    let ring = Arc::new(MulticastRing::with_capacity(64).unwrap());
    let cursor = ring.subscribe("sleeper").unwrap();
    let woke = Arc::new(AtomicU64::new(0));

    let reader_ring = Arc::clone(&ring);
    let reader_woke = Arc::clone(&woke);
    let reader = thread::spawn(move || {
        // Park for up to five seconds; a publish should end it early.
        reader_ring.wait(&cursor, Duration::from_secs(5));
        if let Some((msg, _)) = reader_ring.try_read(&cursor) {
            reader_woke.store(*msg + 1, Ordering::SeqCst);
        }
    });

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    ring.publish(41u64);
    reader.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "wakeup took too long");
    assert_eq!(woke.load(Ordering::SeqCst), 42);
}

#[test]
fn facade_dispatches_both_subscription_shapes() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();

    let zero_copy_mids = Arc::new(Mutex::new(Vec::new()));
    let copies = Arc::new(Mutex::new(Vec::new()));

    let probe = Arc::clone(&zero_copy_mids);
    let _snap_sub = bus
        .subscribe_snapshots("zero-copy", move |snap| {
            probe.lock().unwrap().push(snap.mid_price());
        })
        .unwrap();

    let probe = Arc::clone(&copies);
    let _copy_sub = bus
        .subscribe_books("legacy-copy", move |mut book| {
            // The copy is independently owned: edits must be legal and local.
            book.upsert_bid(1.0, 1.0, 99);
            probe.lock().unwrap().push(book.bids.len());
        })
        .unwrap();

    assert_eq!(bus.snapshot_subscriber_count(), 1);
    assert_eq!(bus.copy_subscriber_count(), 1);

    let mut book = OrderBook::new("BTC-USD", 1, "feed");
    book.last_updated = Some(Utc::now());
    book.upsert_bid(100.0, 2.0, 1);
    book.upsert_ask(100.5, 1.0, 2);
    let _ = bus.publish_book(&book);

    assert!(wait_until(Duration::from_secs(2), || {
        zero_copy_mids.lock().unwrap().len() == 1 && copies.lock().unwrap().len() == 1
    }));
    assert_eq!(zero_copy_mids.lock().unwrap()[0], Some(100.25));
    assert_eq!(copies.lock().unwrap()[0], 2);
    assert_eq!(bus.total_published(), 1);
}

#[test]
fn panicking_callback_is_isolated_and_cursor_advances() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let probe = Arc::clone(&delivered);
    let sub = bus
        .subscribe_snapshots("fragile", move |snap| {
            if snap.sequence() == 1 {
                panic!("boom");
            }
            probe.lock().unwrap().push(snap.sequence());
        })
        .unwrap();

    for seq in 0..3u64 {
        let mut book = OrderBook::new("ETH-USD", 2, "feed");
        book.sequence = seq;
        book.upsert_bid(10.0, 1.0, 1);
        let _ = bus.publish_book(&book);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        delivered.lock().unwrap().len() == 2
    }));
    assert_eq!(*delivered.lock().unwrap(), vec![0, 2]);
    assert_eq!(sub.cursor().consumed(), 3);
    assert_eq!(sub.cursor().lost(), 0);
}

#[test]
fn duplicate_facade_subscription_fails() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let _a = bus.subscribe_snapshots("same", |_| {}).unwrap();
    let err = bus.subscribe_snapshots("same", |_| {}).unwrap_err();
    assert!(matches!(err, BusError::DuplicateConsumer { .. }));
    assert_eq!(bus.snapshot_subscriber_count(), 1);
}

#[test]
fn master_flag_silences_all_publishes() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    bus.set_emission_enabled(false);

    let mut book = OrderBook::new("BTC-USD", 1, "feed");
    book.upsert_bid(100.0, 1.0, 1);
    assert_eq!(bus.publish_book(&book), None);

    let trade = Trade::new("BTC-USD", 1, Utc::now(), 100.0, 1.0, Some(TradeSide::Buy));
    assert_eq!(bus.publish_trade(trade), None);
    assert_eq!(bus.total_published(), 0);

    bus.set_emission_enabled(true);
    assert_eq!(bus.publish_book(&book), Some(0));
    assert_eq!(bus.total_published(), 1);
}

#[test]
fn reset_returns_facade_to_pristine_state() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let mut book = OrderBook::new("BTC-USD", 1, "feed");
    book.upsert_bid(100.0, 1.0, 1);
    let _ = bus.publish_book(&book);
    bus.set_emission_enabled(false);

    bus.reset();

    assert_eq!(bus.total_published(), 0);
    assert!(bus.emission_enabled());
    assert!(bus.providers().entries().is_empty());
    assert_eq!(bus.book_metrics().producer_sequence, None);
}

#[test]
fn trade_stream_is_broadcast_in_order() {
    let bus = MarketDataBus::new(BusConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&seen);
    let _sub = bus
        .subscribe_trades("tape", move |t| probe.lock().unwrap().push(t.price))
        .unwrap();

    for i in 0..5 {
        let trade = Trade::new(
            "BTC-USD",
            1,
            Utc::now(),
            100.0 + f64::from(i),
            1.0,
            Some(TradeSide::Sell),
        );
        let _ = bus.publish_trade(trade);
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 5));
    assert_eq!(*seen.lock().unwrap(), vec![100.0, 101.0, 102.0, 103.0, 104.0]);
}
