//! End-to-end determinism and invariant tests
//!
//! Runs the bundled scenario files through the orchestrator and checks that
//! identical inputs give byte-identical outputs regardless of worker count,
//! and that the aggregated counts obey the outcome conservation and
//! exposure-window invariants.

use std::fs;
use std::path::PathBuf;

use settle_risk::{AuthMode, Orchestrator, ScenarioSpec};

fn scenario_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

fn load(name: &str) -> ScenarioSpec {
    let content = fs::read_to_string(scenario_dir().join(name)).unwrap();
    let file: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();
    let block = serde_yaml::to_string(&file["scenario"]).unwrap();
    ScenarioSpec::from_yaml(&block).unwrap()
}

fn quick(mut spec: ScenarioSpec, runs: u32) -> ScenarioSpec {
    spec.runs = runs;
    spec
}

#[test]
fn test_bundled_scenarios_load() {
    let mut names: Vec<String> = fs::read_dir(scenario_dir())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".yaml"))
        .collect();
    names.sort();
    assert!(names.len() >= 4);

    for name in &names {
        let spec = load(name);
        spec.validate().unwrap();
    }

    assert_eq!(load("baseline.yaml"), ScenarioSpec::default());
    assert_eq!(load("wait_on_chain.yaml").auth_mode, AuthMode::WaitOnChain);
    assert!(load("fraud_limits.yaml").needs_counterfactual());
}

#[test]
fn test_dual_replay_identical() {
    let spec = quick(load("baseline.yaml"), 16);

    let first = Orchestrator::with_max_workers(1).run(&spec, |_| {}).unwrap();
    let second = Orchestrator::with_max_workers(3).run(&spec, |_| {}).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

    // reference fixture: every decided purchase is approved
    assert_eq!(first.declines, 0);
    assert_eq!(first.timeouts, 0);
    assert_eq!(first.approval_rate, 1.0);
    assert_eq!(first.seed, "deterministic");
}

#[test]
fn test_reference_fixture_calibration() {
    let spec = quick(load("baseline.yaml"), 16);
    let result = Orchestrator::new().run(&spec, |_| {}).unwrap();

    // roughly 57 purchases per run, 32 approved and 25 skipped
    let per_run = result.purchase_events as f64 / 16.0;
    assert!((45.0..70.0).contains(&per_run), "{} purchases per run", per_run);
    let skipped = result.insufficient_funds_skipped as f64 / result.purchase_events as f64;
    assert!((0.3..0.6).contains(&skipped), "skip share {}", skipped);

    assert!((0.18..0.26).contains(&result.avg_auth_time_sec), "{}", result.avg_auth_time_sec);
    assert!(
        (10.0..19.0).contains(&result.p95_settlement_time_sec),
        "{}",
        result.p95_settlement_time_sec
    );
}

#[test]
fn test_seed_changes_outcome() {
    let spec = quick(load("baseline.yaml"), 8);
    let mut reseeded = spec.clone();
    reseeded.seed = "another-seed".to_string();

    let a = Orchestrator::new().run(&spec, |_| {}).unwrap();
    let b = Orchestrator::new().run(&reseeded, |_| {}).unwrap();
    assert_ne!(a.avg_auth_time_sec, b.avg_auth_time_sec);
    assert_ne!(a.fingerprint, b.fingerprint);
    assert_eq!(b.seed, "another-seed");
}

#[test]
fn test_outcomes_conserved_across_scenarios() {
    for name in ["baseline.yaml", "wait_on_chain.yaml", "outage.yaml", "fraud_limits.yaml", "pre_auth.yaml"] {
        let spec = quick(load(name), 6);
        let result = Orchestrator::new().run(&spec, |_| {}).unwrap();

        assert_eq!(
            result.approvals
                + result.declines
                + result.timeouts
                + result.insufficient_funds_skipped
                + result.fraud.auto_declined,
            result.purchase_events,
            "{} does not conserve purchases",
            name
        );

        for event in &result.exposure_events {
            assert!(event.end_sec >= event.start_sec, "{}", name);
            assert!(
                event.duration() <= spec.settlement.max_settle_window_sec + 1e-9,
                "{}",
                name
            );
        }

        let rates = result.approval_rate + result.decline_rate + result.timeout_rate;
        assert!(rates == 0.0 || (rates - 1.0).abs() < 1e-9, "{}", name);

        let settled = result.settlement_success_rate + result.settlement_fail_rate;
        assert!(settled == 0.0 || (settled - 1.0).abs() < 1e-9, "{}", name);
    }
}

#[test]
fn test_wait_on_chain_never_exposes() {
    let spec = quick(load("wait_on_chain.yaml"), 6);
    let result = Orchestrator::new().run(&spec, |_| {}).unwrap();
    assert_eq!(result.exposure_count, 0);
    assert!(result.approvals > 0);
    // every approval waited for at least one ledger close
    assert!(result.percentiles["authTime"].p50 >= 4.0);
}

#[test]
fn test_spend_limits_priced_against_counterfactual() {
    let spec = quick(load("fraud_limits.yaml"), 10);
    let result = Orchestrator::new().run(&spec, |_| {}).unwrap();

    assert!(result.fraud.attempts > 0);
    assert!(result.fraud_no_limits.attempts > 0);
    assert!(result.limit_declines > 0);
    assert!(result.fraud.exposure < result.fraud_no_limits.exposure);
}

#[test]
fn test_outage_degrades_settlement() {
    let baseline = quick(load("baseline.yaml"), 10);
    let outage = quick(load("outage.yaml"), 10);

    let normal = Orchestrator::new().run(&baseline, |_| {}).unwrap();
    let degraded = Orchestrator::new().run(&outage, |_| {}).unwrap();

    assert!(degraded.exposure_count > normal.exposure_count);
    assert!(degraded.settlement_fail_rate > normal.settlement_fail_rate);
}
