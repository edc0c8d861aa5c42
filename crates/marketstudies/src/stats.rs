use std::collections::VecDeque;

/// Bounded ring of scalar observations with running mean and deviation.
///
/// Evicts the oldest value once full. Sums are maintained incrementally;
/// at the window sizes used here (hundreds of observations) f64 drift is
/// far below the noise floor of the quantities being measured.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            if let Some(evicted) = self.values.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.sum / self.values.len() as f64)
    }

    /// Sample standard deviation; `None` below two observations.
    pub fn std_dev(&self) -> Option<f64> {
        let n = self.values.len();
        if n < 2 {
            return None;
        }
        let n_f = n as f64;
        let variance = (self.sum_sq - self.sum * self.sum / n_f) / (n_f - 1.0);
        Some(variance.max(0.0).sqrt())
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

/// P² online quantile estimator (Jain & Chlamtac 1985).
///
/// Tracks five markers in constant space. The first five observations seed
/// the markers; until then the estimate falls back to the midpoint of the
/// sorted seed buffer. Used for running medians and MADs where storing the
/// window would be too expensive.
#[derive(Debug, Clone)]
pub struct P2Quantile {
    quantile: f64,
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
    count: usize,
    seed: [f64; 5],
}

impl P2Quantile {
    pub fn new(quantile: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&quantile));
        Self {
            quantile,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [
                1.0,
                1.0 + 2.0 * quantile,
                1.0 + 4.0 * quantile,
                3.0 + 2.0 * quantile,
                5.0,
            ],
            increments: [0.0, quantile / 2.0, quantile, (1.0 + quantile) / 2.0, 1.0],
            count: 0,
            seed: [0.0; 5],
        }
    }

    /// Running-median estimator.
    pub fn median() -> Self {
        Self::new(0.5)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// True once the five seed observations are in place.
    pub fn is_warm(&self) -> bool {
        self.count >= 5
    }

    pub fn observe(&mut self, x: f64) {
        if self.count < 5 {
            self.seed[self.count] = x;
            self.count += 1;
            if self.count == 5 {
                self.seed.sort_unstable_by(f64::total_cmp);
                self.heights = self.seed;
            }
            return;
        }
        self.count += 1;

        // Locate the cell and stretch the extreme markers.
        let k = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            let mut cell = 0;
            while cell < 3 && x >= self.heights[cell + 1] {
                cell += 1;
            }
            cell
        };

        for position in self.positions.iter_mut().skip(k + 1) {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(self.increments) {
            *desired += increment;
        }

        // Nudge the three interior markers toward their desired positions.
        for i in 1..4 {
            let delta = self.desired[i] - self.positions[i];
            let ahead = self.positions[i + 1] - self.positions[i];
            let behind = self.positions[i - 1] - self.positions[i];
            if (delta >= 1.0 && ahead > 1.0) || (delta <= -1.0 && behind < -1.0) {
                let direction = delta.signum();
                let candidate = self.parabolic(i, direction);
                self.heights[i] = if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                    candidate
                } else {
                    self.linear(i, direction)
                };
                self.positions[i] += direction;
            }
        }
    }

    /// Current estimate; `None` before the first observation.
    pub fn value(&self) -> Option<f64> {
        match self.count {
            0 => None,
            n @ 1..=4 => {
                let mut head = self.seed[..n].to_vec();
                head.sort_unstable_by(f64::total_cmp);
                Some(head[(n.saturating_sub(1) as f64 * self.quantile).round() as usize])
            }
            _ => Some(self.heights[2]),
        }
    }

    fn parabolic(&self, i: usize, direction: f64) -> f64 {
        let p = &self.positions;
        let h = &self.heights;
        h[i] + direction / (p[i + 1] - p[i - 1])
            * ((p[i] - p[i - 1] + direction) * (h[i + 1] - h[i]) / (p[i + 1] - p[i])
                + (p[i + 1] - p[i] - direction) * (h[i] - h[i - 1]) / (p[i] - p[i - 1]))
    }

    fn linear(&self, i: usize, direction: f64) -> f64 {
        let j = (i as f64 + direction) as usize;
        self.heights[i]
            + direction * (self.heights[j] - self.heights[i])
                / (self.positions[j] - self.positions[i])
    }
}

/// A robust location/scale pair: running median plus a median of absolute
/// deviations, where the deviation stream starts only after the location
/// estimator has warmed up.
#[derive(Debug, Clone)]
pub struct RobustScale {
    location: P2Quantile,
    dispersion: P2Quantile,
}

impl RobustScale {
    pub fn new() -> Self {
        Self {
            location: P2Quantile::median(),
            dispersion: P2Quantile::median(),
        }
    }

    pub fn observe(&mut self, x: f64) {
        // Deviations measured against a cold median are meaningless noise;
        // hold the MAD stream back until the location estimate settles.
        if self.location.is_warm() {
            if let Some(median) = self.location.value() {
                self.dispersion.observe((x - median).abs());
            }
        }
        self.location.observe(x);
    }

    pub fn median(&self) -> Option<f64> {
        self.location.value()
    }

    pub fn mad(&self) -> Option<f64> {
        self.dispersion.value()
    }

    pub fn is_warm(&self) -> bool {
        self.location.is_warm() && self.dispersion.count() > 0
    }
}

impl Default for RobustScale {
    fn default() -> Self {
        Self::new()
    }
}
