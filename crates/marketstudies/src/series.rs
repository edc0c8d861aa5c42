use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One emitted point of a study's output series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Market midpoint at emission time, for chart annotation.
    pub mid_price: Option<f64>,
    /// Display-format hint, e.g. `"0.00%"`.
    pub format_hint: Option<String>,
    pub color_hint: Option<String>,
    /// Forces a fresh aggregation bucket regardless of the time window.
    pub new_bucket: bool,
}

impl StudyPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            mid_price: None,
            format_hint: None,
            color_hint: None,
            new_bucket: false,
        }
    }

    pub fn with_mid(mut self, mid: Option<f64>) -> Self {
        self.mid_price = mid;
        self
    }

    pub fn with_format(mut self, hint: impl Into<String>) -> Self {
        self.format_hint = Some(hint.into());
        self
    }

    pub fn with_color(mut self, hint: impl Into<String>) -> Self {
        self.color_hint = Some(hint.into());
        self
    }

    pub fn with_new_bucket(mut self, new_bucket: bool) -> Self {
        self.new_bucket = new_bucket;
        self
    }
}

/// The enumerated aggregation windows offered to studies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationWindow {
    None,
    Ms1,
    Ms10,
    Ms100,
    Ms500,
    S1,
    S3,
    S5,
    Daily,
}

impl AggregationWindow {
    /// Window length in milliseconds; `None` disables time bucketing.
    pub fn millis(self) -> Option<i64> {
        match self {
            Self::None => None,
            Self::Ms1 => Some(1),
            Self::Ms10 => Some(10),
            Self::Ms100 => Some(100),
            Self::Ms500 => Some(500),
            Self::S1 => Some(1_000),
            Self::S3 => Some(3_000),
            Self::S5 => Some(5_000),
            Self::Daily => Some(86_400_000),
        }
    }

    /// True when two timestamps land in the same bucket of this window.
    pub fn same_bucket(self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self.millis() {
            None => false,
            Some(ms) => a.timestamp_millis().div_euclid(ms) == b.timestamp_millis().div_euclid(ms),
        }
    }
}

/// Time-unit vocabulary for configuration surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowUnit {
    Milliseconds,
    Seconds,
    Ticks,
    Minutes,
    Hours,
    Days,
}

/// How adjacent points inside one aggregation bucket combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Newest value wins.
    Last,
    /// Incremental arithmetic mean over the bucket.
    RunningMean,
    /// Like `Last`, but a point flagged `new_bucket` always opens a fresh
    /// bucket (used by volume-bucketed studies).
    PassthroughNewBucket,
}

/// Outcome of feeding a point through an aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregated {
    /// The point merged into the current bucket; the carried point is the
    /// bucket's updated value.
    Merged(StudyPoint),
    /// The point opened a new bucket.
    Opened(StudyPoint),
}

impl Aggregated {
    pub fn point(&self) -> &StudyPoint {
        match self {
            Self::Merged(p) | Self::Opened(p) => p,
        }
    }

    pub fn into_point(self) -> StudyPoint {
        match self {
            Self::Merged(p) | Self::Opened(p) => p,
        }
    }
}

/// Stateful bucket aggregator for one study output stream.
#[derive(Debug)]
pub struct SeriesAggregator {
    window: AggregationWindow,
    policy: AggregationPolicy,
    current: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    anchor: DateTime<Utc>,
    point: StudyPoint,
    count: u64,
}

impl SeriesAggregator {
    pub fn new(window: AggregationWindow, policy: AggregationPolicy) -> Self {
        Self {
            window,
            policy,
            current: None,
        }
    }

    pub fn window(&self) -> AggregationWindow {
        self.window
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Feeds one point and reports whether it merged or opened a bucket.
    pub fn push(&mut self, point: StudyPoint) -> Aggregated {
        let force_open = self.policy == AggregationPolicy::PassthroughNewBucket && point.new_bucket;
        if !force_open {
            if let Some(bucket) = self.current.as_mut() {
                if self.window.same_bucket(bucket.anchor, point.timestamp) {
                    bucket.count += 1;
                    match self.policy {
                        AggregationPolicy::Last | AggregationPolicy::PassthroughNewBucket => {
                            bucket.point = point;
                        }
                        AggregationPolicy::RunningMean => {
                            let n = bucket.count as f64;
                            let merged = bucket.point.value * (n - 1.0) / n + point.value / n;
                            bucket.point = point;
                            bucket.point.value = merged;
                        }
                    }
                    return Aggregated::Merged(bucket.point.clone());
                }
            }
        }

        self.current = Some(Bucket {
            anchor: point.timestamp,
            point: point.clone(),
            count: 1,
        });
        Aggregated::Opened(point)
    }
}

/// An in-memory series: aggregation plus the materialised point list.
///
/// Merged points replace the series tail; opened points append. This is the
/// read model chart consumers keep per study.
#[derive(Debug)]
pub struct StudySeries {
    aggregator: SeriesAggregator,
    points: Vec<StudyPoint>,
}

impl StudySeries {
    pub fn new(window: AggregationWindow, policy: AggregationPolicy) -> Self {
        Self {
            aggregator: SeriesAggregator::new(window, policy),
            points: Vec::new(),
        }
    }

    /// Feeds one point, returning the aggregation outcome after the series
    /// has been updated.
    pub fn push(&mut self, point: StudyPoint) -> Aggregated {
        let outcome = self.aggregator.push(point);
        match &outcome {
            Aggregated::Merged(p) => {
                if let Some(last) = self.points.last_mut() {
                    *last = p.clone();
                }
            }
            Aggregated::Opened(p) => self.points.push(p.clone()),
        }
        outcome
    }

    pub fn points(&self) -> &[StudyPoint] {
        &self.points
    }

    pub fn last(&self) -> Option<&StudyPoint> {
        self.points.last()
    }
}
