//! Deterministic, mergeable latency sketch.
//!
//! Fixed log-spaced histogram over 0.1 ms .. 100 s. Two histograms merge by
//! element-wise addition, so per-bucket sketches combine into an aggregate
//! sketch without reordering effects: merge order never changes a quantile
//! read. Memory is bounded by the fixed bin count.
//!
//! Quantile reads return the upper bound of the covering bin, which
//! over-reports latency by at most one bin width (conservative for
//! lower-is-better criteria).

use serde::{Deserialize, Serialize};

/// Number of histogram bins, including the overflow bin.
pub const BIN_COUNT: usize = 64;

/// Lower edge of the first bin, in milliseconds.
const MIN_LATENCY_MS: f64 = 0.1;

/// Upper edge of the last finite bin, in milliseconds (100 s).
const MAX_LATENCY_MS: f64 = 100_000.0;

/// Histogram of latency samples with fixed geometric bin edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    counts: Vec<u64>,
    total: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; BIN_COUNT],
            total: 0,
        }
    }

    /// Upper edge of bin `index`. Edges are geometric between
    /// [`MIN_LATENCY_MS`] and [`MAX_LATENCY_MS`]; the final bin is a
    /// catch-all whose reported bound is [`MAX_LATENCY_MS`].
    fn bin_upper_bound(index: usize) -> f64 {
        if index + 1 >= BIN_COUNT {
            return MAX_LATENCY_MS;
        }
        let span = (MAX_LATENCY_MS / MIN_LATENCY_MS).ln();
        let fraction = (index + 1) as f64 / (BIN_COUNT - 1) as f64;
        MIN_LATENCY_MS * (span * fraction).exp()
    }

    fn bin_for(latency_ms: f64) -> usize {
        if latency_ms.is_nan() || latency_ms <= MIN_LATENCY_MS {
            return 0;
        }
        for index in 0..BIN_COUNT - 1 {
            if latency_ms <= Self::bin_upper_bound(index) {
                return index;
            }
        }
        BIN_COUNT - 1
    }

    /// Record one latency sample. NaN and negative inputs land in the
    /// first bin, oversized ones in the overflow bin; nothing is dropped,
    /// keeping counts consistent with `request_count`.
    pub fn record(&mut self, latency_ms: f64) {
        self.counts[Self::bin_for(latency_ms)] += 1;
        self.total += 1;
    }

    /// Element-wise merge of another histogram into this one.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
        self.total += other.total;
    }

    pub fn sample_count(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Quantile read at `q` in [0, 1]; `None` when no samples recorded.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        // Rank of the target sample, 1-based, rounded up.
        let rank = ((q * self.total as f64).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (index, count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= rank {
                return Some(Self::bin_upper_bound(index));
            }
        }
        Some(Self::bin_upper_bound(BIN_COUNT - 1))
    }

    pub fn p50(&self) -> Option<f64> {
        self.quantile(0.50)
    }

    pub fn p95(&self) -> Option<f64> {
        self.quantile(0.95)
    }

    pub fn p99(&self) -> Option<f64> {
        self.quantile(0.99)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_quantiles() {
        let histogram = LatencyHistogram::new();
        assert!(histogram.is_empty());
        assert_eq!(histogram.p95(), None);
    }

    #[test]
    fn single_sample_dominates_every_quantile() {
        let mut histogram = LatencyHistogram::new();
        histogram.record(250.0);
        let p50 = histogram.p50().expect("samples exist");
        let p99 = histogram.p99().expect("samples exist");
        assert_eq!(p50, p99);
        assert!(p50 >= 250.0, "bin upper bound covers the sample");
    }

    #[test]
    fn quantile_reads_are_ordered() {
        let mut histogram = LatencyHistogram::new();
        for latency in [5.0, 10.0, 20.0, 40.0, 80.0, 160.0, 320.0, 640.0, 1_280.0, 2_560.0] {
            histogram.record(latency);
        }
        let p50 = histogram.p50().expect("samples");
        let p95 = histogram.p95().expect("samples");
        let p99 = histogram.p99().expect("samples");
        assert!(p50 <= p95);
        assert!(p95 <= p99);
    }

    #[test]
    fn merge_equals_recording_into_one_histogram() {
        let samples_left = [1.0, 50.0, 900.0, 4.2];
        let samples_right = [0.3, 75.0, 12_000.0];

        let mut left = LatencyHistogram::new();
        for s in samples_left {
            left.record(s);
        }
        let mut right = LatencyHistogram::new();
        for s in samples_right {
            right.record(s);
        }
        left.merge(&right);

        let mut combined = LatencyHistogram::new();
        for s in samples_left.into_iter().chain(samples_right) {
            combined.record(s);
        }

        assert_eq!(left, combined);
        assert_eq!(left.sample_count(), 7);
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = LatencyHistogram::new();
        a.record(10.0);
        let mut b = LatencyHistogram::new();
        b.record(1_000.0);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
    }

    #[test]
    fn pathological_inputs_land_in_first_bin() {
        let mut histogram = LatencyHistogram::new();
        histogram.record(-5.0);
        histogram.record(f64::NAN);
        histogram.record(f64::INFINITY);
        // Infinity goes to the overflow bin, the rest to the first.
        assert_eq!(histogram.sample_count(), 3);
        assert_eq!(histogram.quantile(0.0).expect("samples"), LatencyHistogram::bin_upper_bound(0));
    }

    #[test]
    fn overflow_samples_report_the_ceiling() {
        let mut histogram = LatencyHistogram::new();
        histogram.record(500_000.0);
        assert_eq!(histogram.p99().expect("samples"), 100_000.0);
    }
}
