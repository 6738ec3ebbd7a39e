//! Merge per-run results into one [`AggregateResult`].
//!
//! Counters are summed and raw samples concatenated; every rate, mean and
//! percentile is then recomputed from the merged arrays. Runs are sorted by
//! index first so the result does not depend on which worker finished when.

use indexmap::IndexMap;

use crate::sr_results::{AggregateResult, FraudMetrics, RunCounters, RunResult, TimeBucket};
use crate::sr_scenario::ScenarioSpec;
use crate::sr_stats::{histogram, mean, percentile, percentile_table, rate, DEFAULT_HISTOGRAM_BINS};

/// Samples concatenated across runs
#[derive(Default)]
struct MergedSamples {
    counters: RunCounters,
    auth_times: Vec<f64>,
    settlement_times: Vec<f64>,
    retries: Vec<f64>,
    exposure_amounts: Vec<f64>,
    exposure_durations: Vec<f64>,
    exposure_per_user: Vec<f64>,
    pending_holds: Vec<f64>,
    time_series: Vec<TimeBucket>,
}

fn sorted_runs(runs: &[RunResult]) -> Vec<&RunResult> {
    let mut sorted: Vec<&RunResult> = runs.iter().collect();
    sorted.sort_by_key(|run| run.run_index);
    sorted
}

fn merge(runs: &[&RunResult]) -> MergedSamples {
    let mut merged = MergedSamples::default();

    for run in runs {
        merged.counters.merge(&run.counters);
        merged.auth_times.extend_from_slice(&run.auth_times);
        merged.settlement_times.extend_from_slice(&run.settlement_times);
        merged.retries.extend(run.retries.iter().map(|r| *r as f64));
        merged
            .exposure_amounts
            .extend(run.exposure_events.iter().map(|e| e.amount));
        merged
            .exposure_durations
            .extend(run.exposure_events.iter().map(|e| e.duration()));
        merged.exposure_per_user.extend_from_slice(&run.exposure_per_user);
        merged.pending_holds.extend_from_slice(&run.pending_hold_samples);

        if merged.time_series.len() < run.time_series.len() {
            let start = merged.time_series.len();
            merged
                .time_series
                .extend(run.time_series[start..].iter().map(|b| TimeBucket {
                    time_sec: b.time_sec,
                    ..TimeBucket::default()
                }));
        }
        for (total, bucket) in merged.time_series.iter_mut().zip(&run.time_series) {
            total.exposure += bucket.exposure;
            total.approvals += bucket.approvals;
            total.declines += bucket.declines;
            total.timeouts += bucket.timeouts;
        }
    }

    if !runs.is_empty() {
        let n = runs.len() as f64;
        for bucket in &mut merged.time_series {
            bucket.exposure /= n;
            bucket.approvals /= n;
            bucket.declines /= n;
            bucket.timeouts /= n;
        }
    }

    merged
}

fn fraud_metrics(counters: &RunCounters) -> FraudMetrics {
    FraudMetrics {
        attempts: counters.fraud_attempts,
        auto_declined: counters.fraud_auto_declined,
        approved: counters.fraud_approved,
        attempt_rate: rate(counters.fraud_attempts, counters.purchase_events),
        approval_rate: rate(counters.fraud_approved, counters.fraud_attempts),
        exposure: counters.fraud_exposure,
        loss: counters.fraud_loss,
    }
}

/// Aggregate a complete run set. The counterfactual fraud metrics mirror the
/// primary ones; see [`with_counterfactual`].
pub fn aggregate(spec: &ScenarioSpec, runs: &[RunResult]) -> AggregateResult {
    let sorted = sorted_runs(runs);
    let merged = merge(&sorted);
    let c = &merged.counters;
    let decided = c.decided();
    let settled = c.settlements_confirmed + c.settlements_failed;

    let mut exposure_events = Vec::new();
    for run in &sorted {
        exposure_events.extend(run.exposure_events.iter().cloned());
    }

    let mut histograms = IndexMap::new();
    let mut percentiles = IndexMap::new();
    for (name, values) in [
        ("settlementTime", &merged.settlement_times),
        ("authTime", &merged.auth_times),
        ("exposureAmount", &merged.exposure_amounts),
        ("exposurePerUser", &merged.exposure_per_user),
        ("retries", &merged.retries),
        ("exposureDuration", &merged.exposure_durations),
    ] {
        histograms.insert(name.to_string(), histogram(values, DEFAULT_HISTOGRAM_BINS));
        percentiles.insert(name.to_string(), percentile_table(values));
    }

    let fraud = fraud_metrics(c);

    AggregateResult {
        seed: spec.seed.clone(),
        fingerprint: spec.fingerprint(),
        summary: spec.summary(),
        runs: sorted.len(),

        purchase_events: c.purchase_events,
        approvals: c.approvals,
        declines: c.declines,
        timeouts: c.timeouts,
        approval_rate: rate(c.approvals, decided),
        decline_rate: rate(c.declines, decided),
        timeout_rate: rate(c.timeouts, decided),

        avg_auth_time_sec: mean(&merged.auth_times),
        p95_auth_time_sec: percentile(&merged.auth_times, 95.0),
        avg_settlement_time_sec: mean(&merged.settlement_times),
        p95_settlement_time_sec: percentile(&merged.settlement_times, 95.0),
        settlement_success_rate: rate(c.settlements_confirmed, settled),
        settlement_fail_rate: rate(c.settlements_failed, settled),
        p95_retries: percentile(&merged.retries, 95.0),

        exposure_count: merged.exposure_amounts.len(),
        total_exposure: merged.exposure_amounts.iter().sum(),
        peak_exposure: merged.exposure_amounts.iter().copied().fold(0.0, f64::max),
        p95_exposure: percentile(&merged.exposure_amounts, 95.0),
        p95_exposure_duration_sec: percentile(&merged.exposure_durations, 95.0),

        overspend_prevented: c.overspend_prevented,
        avg_pending_holds: mean(&merged.pending_holds),
        p95_pending_holds: percentile(&merged.pending_holds, 95.0),

        pre_auth_mismatch_rate: rate(c.pre_auth_mismatches, c.completions),
        incremental_auth_success_rate: rate(c.incremental_successes, c.incremental_attempts),

        fraud_no_limits: fraud.clone(),
        fraud,

        limit_declines: c.limit_declines,
        total_spend: c.total_spend,
        insufficient_funds_skipped: c.insufficient_funds_skipped,

        time_series: merged.time_series,
        histograms,
        percentiles,
        exposure_events,
    }
}

/// Attach fraud metrics from a run set executed without spend limits
pub fn with_counterfactual(mut result: AggregateResult, baseline: &[RunResult]) -> AggregateResult {
    let sorted = sorted_runs(baseline);
    let mut counters = RunCounters::default();
    for run in &sorted {
        counters.merge(&run.counters);
    }
    result.fraud_no_limits = fraud_metrics(&counters);
    result
}

/// Aggregate, attaching the counterfactual only when the scenario needs it
pub fn aggregate_with_counterfactual(
    spec: &ScenarioSpec,
    runs: &[RunResult],
    baseline: Option<&[RunResult]>,
) -> AggregateResult {
    let result = aggregate(spec, runs);
    match baseline {
        Some(baseline) if spec.needs_counterfactual() => with_counterfactual(result, baseline),
        _ => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sr_kernel::run_once;
    use crate::sr_results::ExposureEvent;
    use proptest::prelude::*;

    fn synthetic_run(run_index: u32, auth: &[f64], exposures: &[(f64, f64, f64)]) -> RunResult {
        RunResult {
            run_index,
            counters: RunCounters {
                purchase_events: auth.len() + 1,
                approvals: auth.len(),
                timeouts: 1,
                settlements_confirmed: auth.len(),
                ..Default::default()
            },
            auth_times: auth.to_vec(),
            settlement_times: auth.iter().map(|a| a * 20.0).collect(),
            retries: vec![0; auth.len()],
            exposure_events: exposures
                .iter()
                .enumerate()
                .map(|(i, (amount, start, end))| ExposureEvent {
                    user: i as u32,
                    tx: i as u64,
                    amount: *amount,
                    start_sec: *start,
                    end_sec: *end,
                })
                .collect(),
            exposure_per_user: exposures.iter().map(|e| e.0).collect(),
            pending_hold_samples: vec![10.0, 20.0],
            time_series: vec![
                TimeBucket {
                    time_sec: 0.0,
                    approvals: auth.len() as f64,
                    ..Default::default()
                },
                TimeBucket {
                    time_sec: 60.0,
                    timeouts: 1.0,
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_rates_from_merged_samples() {
        let spec = ScenarioSpec::default();
        let runs = vec![
            synthetic_run(0, &[0.1, 0.2, 0.3], &[(50.0, 0.0, 10.0)]),
            synthetic_run(1, &[0.4], &[(80.0, 5.0, 65.0), (20.0, 1.0, 2.0)]),
        ];
        let result = aggregate(&spec, &runs);

        assert_eq!(result.runs, 2);
        assert_eq!(result.approvals, 4);
        assert_eq!(result.timeouts, 2);
        assert_eq!(result.purchase_events, 6);
        assert!((result.approval_rate - 4.0 / 6.0).abs() < 1e-12);
        assert!((result.timeout_rate - 2.0 / 6.0).abs() < 1e-12);
        assert!((result.avg_auth_time_sec - 0.25).abs() < 1e-12);
        assert_eq!(result.p95_auth_time_sec, 0.4);

        assert_eq!(result.exposure_count, 3);
        assert_eq!(result.total_exposure, 150.0);
        assert_eq!(result.peak_exposure, 80.0);
        assert_eq!(result.p95_exposure_duration_sec, 60.0);
        assert_eq!(result.settlement_success_rate, 1.0);

        // per-run average series
        assert_eq!(result.time_series.len(), 2);
        assert_eq!(result.time_series[0].approvals, 2.0);
        assert_eq!(result.time_series[1].timeouts, 1.0);
        assert_eq!(result.time_series[1].time_sec, 60.0);

        assert_eq!(result.histograms.len(), 6);
        assert_eq!(result.histograms["authTime"].len(), DEFAULT_HISTOGRAM_BINS);
        assert_eq!(result.percentiles["exposureAmount"].max, 80.0);
        assert_eq!(result.seed, "deterministic");
        assert_eq!(result.fingerprint, spec.fingerprint());
    }

    #[test]
    fn test_empty_run_set() {
        let result = aggregate(&ScenarioSpec::default(), &[]);
        assert_eq!(result.runs, 0);
        assert_eq!(result.approval_rate, 0.0);
        assert_eq!(result.peak_exposure, 0.0);
        assert!(result.time_series.is_empty());
        assert!(result.histograms["authTime"].is_empty());
    }

    #[test]
    fn test_split_equals_whole() {
        // two run sets whose samples were pre-merged must aggregate identically
        let spec = ScenarioSpec::default();
        let a = synthetic_run(0, &[0.1, 0.5], &[(10.0, 0.0, 1.0)]);
        let b = synthetic_run(1, &[0.3], &[(30.0, 2.0, 4.0)]);

        let whole = synthetic_run(0, &[0.1, 0.5, 0.3], &[(10.0, 0.0, 1.0), (30.0, 2.0, 4.0)]);

        let split = aggregate(&spec, &[a, b]);
        let single = aggregate(&spec, &[whole]);
        assert_eq!(split.approvals, single.approvals);
        assert_eq!(split.avg_auth_time_sec, single.avg_auth_time_sec);
        assert_eq!(split.p95_auth_time_sec, single.p95_auth_time_sec);
        assert_eq!(split.p95_exposure, single.p95_exposure);
        assert_eq!(split.percentiles["authTime"], single.percentiles["authTime"]);
    }

    #[test]
    fn test_counterfactual_mirrors_without_baseline() {
        let mut spec = ScenarioSpec::default();
        spec.users.count = 10;
        spec.fraud.enabled = true;
        spec.fraud.attempt_rate = 0.5;
        let runs: Vec<RunResult> = (0..4).map(|i| run_once(&spec, i)).collect();

        let result = aggregate_with_counterfactual(&spec, &runs, None);
        assert_eq!(result.fraud, result.fraud_no_limits);
        assert!(result.fraud.attempts > 0);
    }

    #[test]
    fn test_counterfactual_attached() {
        let mut spec = ScenarioSpec::default();
        spec.users.count = 20;
        spec.fraud.enabled = true;
        spec.fraud.attempt_rate = 0.5;
        spec.fraud.auto_decline_rate = 0.0;
        spec.spend_limits.enabled = true;
        spec.spend_limits.per_transaction = Some(30.0);
        assert!(spec.needs_counterfactual());

        let baseline_spec = spec.without_spend_limits();
        let runs: Vec<RunResult> = (0..4).map(|i| run_once(&spec, i)).collect();
        let baseline: Vec<RunResult> = (0..4).map(|i| run_once(&baseline_spec, i)).collect();

        let result = aggregate_with_counterfactual(&spec, &runs, Some(&baseline));
        assert_ne!(result.fraud, result.fraud_no_limits);
        assert!(result.fraud_no_limits.attempts > 0);
        assert!(result.fraud.approval_rate < result.fraud_no_limits.approval_rate);
    }

    #[test]
    fn test_json_export() {
        let spec = ScenarioSpec {
            runs: 2,
            ..ScenarioSpec::default()
        };
        let runs: Vec<RunResult> = (0..2).map(|i| run_once(&spec, i)).collect();
        let json = aggregate(&spec, &runs).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["approvalRate"].is_number());
        assert!(value["fraudNoLimits"]["approvalRate"].is_number());
        assert!(value["percentiles"]["settlementTime"]["p95"].is_number());
        assert_eq!(value["seed"], "deterministic");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_order_independent(
            samples in proptest::collection::vec(
                proptest::collection::vec(0.0f64..10.0, 0..6),
                1..6,
            ),
            rotate in 0usize..6,
        ) {
            let spec = ScenarioSpec::default();
            let runs: Vec<RunResult> = samples
                .iter()
                .enumerate()
                .map(|(i, auth)| {
                    let exposures: Vec<(f64, f64, f64)> =
                        auth.iter().map(|a| (*a * 3.0, *a, *a * 2.0)).collect();
                    synthetic_run(i as u32, auth, &exposures)
                })
                .collect();

            let mut shuffled = runs.clone();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);
            shuffled.reverse();

            prop_assert_eq!(aggregate(&spec, &runs), aggregate(&spec, &shuffled));
        }
    }
}
