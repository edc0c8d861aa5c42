use marketbus::{Trade, TradeSide};

/// Configuration for the volume-synchronised bucketing engine.
#[derive(Debug, Clone)]
pub struct VpinConfig {
    /// Bucket size `B` in traded volume.
    pub bucket_volume: f64,
}

impl Default for VpinConfig {
    fn default() -> Self {
        Self {
            bucket_volume: 1000.0,
        }
    }
}

/// One VPIN reading.
///
/// Interim readings (`is_new_bucket == false`) report the imbalance of the
/// bucket in progress; boundary readings close a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VpinReading {
    pub vpin: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub bucket_volume: f64,
    pub is_new_bucket: bool,
}

/// VPIN bucketing engine.
///
/// Accumulates signed volume into fixed-size buckets; a trade that
/// overfills the current bucket closes it at exactly `B` and seeds the next
/// bucket with the overflow on the same side. Trades without an aggressor
/// side are never attributed to either total.
#[derive(Debug)]
pub struct VpinCalculator {
    bucket_cap: f64,
    buy_volume: f64,
    sell_volume: f64,
    bucket_volume: f64,
    last_mid: Option<f64>,
}

impl VpinCalculator {
    pub fn new(config: &VpinConfig) -> Self {
        Self {
            bucket_cap: config.bucket_volume,
            buy_volume: 0.0,
            sell_volume: 0.0,
            bucket_volume: 0.0,
            last_mid: None,
        }
    }

    /// Latest market midpoint, carried onto emitted series points.
    pub fn set_mid(&mut self, mid: f64) {
        self.last_mid = Some(mid);
    }

    pub fn mid(&self) -> Option<f64> {
        self.last_mid
    }

    pub fn bucket_volume(&self) -> f64 {
        self.bucket_volume
    }

    /// Feeds one trade. Returns no readings for unknown-side trades, one
    /// interim reading while the bucket fills, and one boundary reading per
    /// bucket the trade closes.
    pub fn on_trade(&mut self, trade: &Trade) -> Vec<VpinReading> {
        let Some(side) = trade.side else {
            return Vec::new();
        };
        let mut readings = Vec::with_capacity(1);
        let mut remaining = trade.size;

        while remaining > 0.0 {
            let room = self.bucket_cap - self.bucket_volume;
            if remaining < room {
                self.add(side, remaining);
                readings.push(self.reading(false));
                break;
            }

            // Fill to the brim, close the bucket, carry the rest over. An
            // exact fill closes too, seeding nothing.
            self.add(side, room);
            readings.push(self.reading(true));
            self.buy_volume = 0.0;
            self.sell_volume = 0.0;
            self.bucket_volume = 0.0;
            remaining -= room;
        }

        readings
    }

    fn add(&mut self, side: TradeSide, size: f64) {
        match side {
            TradeSide::Buy => self.buy_volume += size,
            TradeSide::Sell => self.sell_volume += size,
        }
        self.bucket_volume += size;
    }

    fn reading(&self, is_new_bucket: bool) -> VpinReading {
        let total = self.buy_volume + self.sell_volume;
        let vpin = if total > 0.0 {
            (self.buy_volume - self.sell_volume).abs() / total
        } else {
            0.0
        };
        VpinReading {
            vpin,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            bucket_volume: self.bucket_volume,
            is_new_bucket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trade(size: f64, side: Option<TradeSide>) -> Trade {
        Trade::new("BTC-USD", 1, Utc::now(), 100.0, size, side)
    }

    fn engine(bucket: f64) -> VpinCalculator {
        VpinCalculator::new(&VpinConfig {
            bucket_volume: bucket,
        })
    }

    #[test]
    fn balanced_flow_stays_at_zero() {
        let mut vpin = engine(100.0);
        for i in 0..8 {
            let side = if i % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell };
            let readings = vpin.on_trade(&trade(10.0, Some(side)));
            if i % 2 == 1 {
                assert_eq!(readings[0].vpin, 0.0);
            }
        }
    }

    #[test]
    fn one_sided_bucket_reads_one() {
        let mut vpin = engine(100.0);
        let mut boundary = None;
        for _ in 0..100 {
            for reading in vpin.on_trade(&trade(1.0, Some(TradeSide::Buy))) {
                if reading.is_new_bucket {
                    boundary = Some(reading);
                }
            }
        }
        let boundary = boundary.expect("bucket should have closed");
        assert_eq!(boundary.vpin, 1.0);
        assert_eq!(boundary.buy_volume, 100.0);
        assert_eq!(vpin.bucket_volume(), 0.0);
    }

    #[test]
    fn balanced_halves_read_zero_at_boundary() {
        let mut vpin = engine(200.0);
        for _ in 0..100 {
            vpin.on_trade(&trade(1.0, Some(TradeSide::Buy)));
        }
        let mut boundary = None;
        for _ in 0..100 {
            for reading in vpin.on_trade(&trade(1.0, Some(TradeSide::Sell))) {
                if reading.is_new_bucket {
                    boundary = Some(reading);
                }
            }
        }
        let boundary = boundary.expect("bucket should have closed");
        assert_eq!(boundary.vpin, 0.0);
        assert_eq!(boundary.buy_volume, 100.0);
        assert_eq!(boundary.sell_volume, 100.0);
    }

    #[test]
    fn overflow_closes_at_cap_and_seeds_next_bucket() {
        let mut vpin = engine(100.0);
        vpin.on_trade(&trade(95.0, Some(TradeSide::Buy)));

        let readings = vpin.on_trade(&trade(12.0, Some(TradeSide::Buy)));
        assert_eq!(readings.len(), 2);

        let boundary = readings[0];
        assert!(boundary.is_new_bucket);
        assert_eq!(boundary.vpin, 1.0);
        assert_eq!(boundary.buy_volume, 100.0);
        assert_eq!(boundary.bucket_volume, 100.0);

        let carried = readings[1];
        assert!(!carried.is_new_bucket);
        assert_eq!(carried.buy_volume, 7.0);
        assert_eq!(carried.bucket_volume, 7.0);
    }

    #[test]
    fn unknown_side_is_skipped_not_attributed() {
        let mut vpin = engine(100.0);
        assert!(vpin.on_trade(&trade(50.0, None)).is_empty());
        assert_eq!(vpin.bucket_volume(), 0.0);

        let readings = vpin.on_trade(&trade(10.0, Some(TradeSide::Buy)));
        assert_eq!(readings[0].vpin, 1.0);
        assert_eq!(readings[0].bucket_volume, 10.0);
    }

    #[test]
    fn interim_readings_stay_in_unit_interval() {
        let mut vpin = engine(50.0);
        let sizes = [3.0, 7.0, 1.5, 12.0, 0.5, 20.0, 9.0];
        for (i, size) in sizes.iter().enumerate() {
            let side = if i % 3 == 0 { TradeSide::Sell } else { TradeSide::Buy };
            for reading in vpin.on_trade(&trade(*size, Some(side))) {
                assert!((0.0..=1.0).contains(&reading.vpin));
                assert!(reading.bucket_volume <= 50.0);
            }
        }
    }
}
