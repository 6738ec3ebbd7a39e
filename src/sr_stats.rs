// Summary statistics over raw sample arrays

use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTOGRAM_BINS: usize = 20;

/// One histogram bin covering `[start, end)`; the last bin also holds `end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub start: f64,
    pub end: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileTable {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Nearest-rank percentile on a sorted copy. Empty input gives 0.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Fixed bin-count histogram over `[min, max]`
pub fn histogram(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    if values.is_empty() || bins == 0 {
        return Vec::new();
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = if max > min {
        (max - min) / bins as f64
    } else {
        1.0
    };

    let mut result: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            start: min + i as f64 * width,
            end: min + (i + 1) as f64 * width,
            count: 0,
        })
        .collect();

    for v in values {
        let idx = (((v - min) / width).floor() as usize).min(bins - 1);
        result[idx].count += 1;
    }

    result
}

pub fn percentile_table(values: &[f64]) -> PercentileTable {
    if values.is_empty() {
        return PercentileTable::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    PercentileTable {
        count: sorted.len(),
        mean: mean(values),
        p50: percentile_sorted(&sorted, 50.0),
        p90: percentile_sorted(&sorted, 90.0),
        p95: percentile_sorted(&sorted, 95.0),
        p99: percentile_sorted(&sorted, 99.0),
        max: sorted[sorted.len() - 1],
    }
}

/// `numerator / denominator`, 0 when nothing was counted
#[inline]
pub fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let values = [15.0, 20.0, 35.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 30.0), 20.0);
        assert_eq!(percentile(&values, 40.0), 20.0);
        assert_eq!(percentile(&values, 50.0), 35.0);
        assert_eq!(percentile(&values, 100.0), 50.0);
        assert_eq!(percentile(&values, 0.0), 15.0);
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let values = [9.0, 1.0, 5.0, 3.0, 7.0, 2.0, 8.0, 4.0, 6.0, 10.0];
        assert_eq!(percentile(&values, 95.0), 10.0);
        assert_eq!(percentile(&values, 50.0), 5.0);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(mean(&[]), 0.0);
        assert!(histogram(&[], 10).is_empty());
        assert_eq!(percentile_table(&[]), PercentileTable::default());
        assert_eq!(rate(3, 0), 0.0);
    }

    #[test]
    fn test_histogram_counts_everything() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let bins = histogram(&values, 10);
        assert_eq!(bins.len(), 10);
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 100);
        assert!(bins.iter().all(|b| b.count == 10));
        assert!((bins[0].end - 9.9).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_degenerate_width() {
        let bins = histogram(&[4.0, 4.0, 4.0], 5);
        assert_eq!(bins[0].count, 3);
        assert_eq!(bins[0].end - bins[0].start, 1.0);
    }

    #[test]
    fn test_percentile_table() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        let table = percentile_table(&values);
        assert_eq!(table.count, 100);
        assert_eq!(table.p50, 50.0);
        assert_eq!(table.p95, 95.0);
        assert_eq!(table.p99, 99.0);
        assert_eq!(table.max, 100.0);
        assert!((table.mean - 50.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_percentile_within_bounds(
            values in prop::collection::vec(-1e6f64..1e6, 1..200),
            p in 0.0f64..=100.0,
        ) {
            let v = percentile(&values, p);
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(v >= min && v <= max);
            prop_assert!(values.contains(&v));
        }

        #[test]
        fn prop_percentile_ignores_order(mut values in prop::collection::vec(0f64..1e4, 1..100)) {
            let before = percentile(&values, 95.0);
            values.reverse();
            prop_assert_eq!(before, percentile(&values, 95.0));
        }
    }
}
