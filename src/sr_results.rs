//! Per-run outputs and aggregated statistics.
//!
//! A [`RunResult`] holds the raw samples of one Monte Carlo run. The
//! aggregator concatenates those samples across runs and computes every
//! rate and percentile from the merged arrays, producing an
//! [`AggregateResult`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::sr_error::ConfigError;
use crate::sr_interface::{Amount, SimTime, TxId, UserId};
use crate::sr_stats::{HistogramBin, PercentileTable};

// ============================================================================
// Run Result
// ============================================================================

/// Raw output of one run. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_index: u32,

    pub counters: RunCounters,

    /// End-to-end authorization latency of every approval
    pub auth_times: Vec<f64>,

    /// Time from approval (or request, when waiting on chain) to confirmed settlement
    pub settlement_times: Vec<f64>,

    /// Retries used by every settlement
    pub retries: Vec<u32>,

    pub exposure_events: Vec<ExposureEvent>,

    /// Exposure summed per user, users without exposure omitted
    pub exposure_per_user: Vec<f64>,

    /// Total outstanding holds across users, sampled at each hold placement
    pub pending_hold_samples: Vec<f64>,

    pub time_series: Vec<TimeBucket>,
}

/// Event counters of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub purchase_events: usize,
    pub approvals: usize,
    pub declines: usize,
    pub timeouts: usize,
    pub limit_declines: usize,
    pub insufficient_funds_skipped: usize,
    pub overspend_prevented: usize,

    pub fraud_attempts: usize,
    pub fraud_auto_declined: usize,
    pub fraud_approved: usize,
    pub fraud_exposure: Amount,
    pub fraud_loss: Amount,

    pub settlements_confirmed: usize,
    pub settlements_failed: usize,

    pub completions: usize,
    pub pre_auth_mismatches: usize,
    pub incremental_attempts: usize,
    pub incremental_successes: usize,

    pub hold_expiries: usize,

    /// Amount actually debited from balances
    pub total_spend: Amount,
}

impl RunCounters {
    pub fn merge(&mut self, other: &RunCounters) {
        self.purchase_events += other.purchase_events;
        self.approvals += other.approvals;
        self.declines += other.declines;
        self.timeouts += other.timeouts;
        self.limit_declines += other.limit_declines;
        self.insufficient_funds_skipped += other.insufficient_funds_skipped;
        self.overspend_prevented += other.overspend_prevented;
        self.fraud_attempts += other.fraud_attempts;
        self.fraud_auto_declined += other.fraud_auto_declined;
        self.fraud_approved += other.fraud_approved;
        self.fraud_exposure += other.fraud_exposure;
        self.fraud_loss += other.fraud_loss;
        self.settlements_confirmed += other.settlements_confirmed;
        self.settlements_failed += other.settlements_failed;
        self.completions += other.completions;
        self.pre_auth_mismatches += other.pre_auth_mismatches;
        self.incremental_attempts += other.incremental_attempts;
        self.incremental_successes += other.incremental_successes;
        self.hold_expiries += other.hold_expiries;
        self.total_spend += other.total_spend;
    }

    /// Purchases that reached an approve/decline/timeout decision
    pub fn decided(&self) -> usize {
        self.approvals + self.declines + self.timeouts
    }
}

/// Money approved without timely confirmed settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEvent {
    pub user: UserId,
    pub tx: TxId,
    pub amount: Amount,
    pub start_sec: SimTime,
    pub end_sec: SimTime,
}

impl ExposureEvent {
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// Bucket start
    pub time_sec: f64,
    pub exposure: Amount,
    pub approvals: f64,
    pub declines: f64,
    pub timeouts: f64,
}

// ============================================================================
// Aggregate Result
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudMetrics {
    pub attempts: usize,
    pub auto_declined: usize,
    pub approved: usize,

    /// Fraudulent attempts over all purchase events
    pub attempt_rate: f64,

    /// Approved over attempted fraud
    pub approval_rate: f64,

    /// Approved fraudulent amount
    pub exposure: Amount,

    /// Fraudulent amount that settled
    pub loss: Amount,
}

/// Statistics over all runs of a scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub seed: String,
    pub fingerprint: String,
    pub summary: String,
    pub runs: usize,

    pub purchase_events: usize,
    pub approvals: usize,
    pub declines: usize,
    pub timeouts: usize,
    pub approval_rate: f64,
    pub decline_rate: f64,
    pub timeout_rate: f64,

    pub avg_auth_time_sec: f64,
    pub p95_auth_time_sec: f64,
    pub avg_settlement_time_sec: f64,
    pub p95_settlement_time_sec: f64,
    pub settlement_success_rate: f64,
    pub settlement_fail_rate: f64,
    pub p95_retries: f64,

    pub exposure_count: usize,
    pub total_exposure: Amount,
    /// Largest single exposure amount
    pub peak_exposure: Amount,
    pub p95_exposure: Amount,
    pub p95_exposure_duration_sec: f64,

    pub overspend_prevented: usize,
    pub avg_pending_holds: Amount,
    pub p95_pending_holds: Amount,

    pub pre_auth_mismatch_rate: f64,
    pub incremental_auth_success_rate: f64,

    pub fraud: FraudMetrics,
    /// Same scenario with spend limits disabled
    pub fraud_no_limits: FraudMetrics,

    pub limit_declines: usize,
    pub total_spend: Amount,
    pub insufficient_funds_skipped: usize,

    /// Per-run average series
    pub time_series: Vec<TimeBucket>,
    pub histograms: IndexMap<String, Vec<HistogramBin>>,
    pub percentiles: IndexMap<String, PercentileTable>,
    pub exposure_events: Vec<ExposureEvent>,
}

impl AggregateResult {
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Print a summary of the simulation results
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Settlement Risk Simulation Results             ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Scenario:");
        println!("  {}", self.summary);
        println!("  Seed: {:?}", self.seed);
        println!("  Fingerprint: {}", &self.fingerprint[..self.fingerprint.len().min(16)]);
        println!("  Runs: {}\n", self.runs);

        println!("Authorization:");
        println!("  Purchase events: {}", self.purchase_events);
        println!(
            "  Approved: {} ({:.1}%)  Declined: {} ({:.1}%)  Timed out: {} ({:.1}%)",
            self.approvals,
            self.approval_rate * 100.0,
            self.declines,
            self.decline_rate * 100.0,
            self.timeouts,
            self.timeout_rate * 100.0
        );
        println!(
            "  Auth time: avg={:.4}s p95={:.4}s",
            self.avg_auth_time_sec, self.p95_auth_time_sec
        );
        println!(
            "  Insufficient funds skipped: {}  Overspend prevented: {}  Limit declines: {}",
            self.insufficient_funds_skipped, self.overspend_prevented, self.limit_declines
        );
        println!();

        println!("Settlement:");
        println!(
            "  Success: {:.1}%  Failed: {:.1}%  Retries p95: {}",
            self.settlement_success_rate * 100.0,
            self.settlement_fail_rate * 100.0,
            self.p95_retries
        );
        println!(
            "  Settlement time: avg={:.3}s p95={:.3}s",
            self.avg_settlement_time_sec, self.p95_settlement_time_sec
        );
        println!("  Total spend: {:.2}", self.total_spend);
        println!();

        println!("Exposure:");
        println!(
            "  Events: {}  Total: {:.2}  Peak: {:.2}  p95: {:.2}",
            self.exposure_count, self.total_exposure, self.peak_exposure, self.p95_exposure
        );
        println!("  Duration p95: {:.2}s", self.p95_exposure_duration_sec);
        println!(
            "  Pending holds: avg={:.2} p95={:.2}",
            self.avg_pending_holds, self.p95_pending_holds
        );
        println!();

        println!("Pre-authorization:");
        println!("  Mismatch rate: {:.1}%", self.pre_auth_mismatch_rate * 100.0);
        println!(
            "  Incremental success rate: {:.1}%",
            self.incremental_auth_success_rate * 100.0
        );
        println!();

        println!("Fraud:                 with limits    no limits");
        println!(
            "  Attempts:            {:>11}  {:>11}",
            self.fraud.attempts, self.fraud_no_limits.attempts
        );
        println!(
            "  Approval rate:       {:>10.1}%  {:>10.1}%",
            self.fraud.approval_rate * 100.0,
            self.fraud_no_limits.approval_rate * 100.0
        );
        println!(
            "  Exposure:            {:>11.2}  {:>11.2}",
            self.fraud.exposure, self.fraud_no_limits.exposure
        );
        println!(
            "  Loss:                {:>11.2}  {:>11.2}",
            self.fraud.loss, self.fraud_no_limits.loss
        );
        println!();

        if !self.percentiles.is_empty() {
            println!("Percentiles:            p50        p90        p95        p99        max");
            for (name, table) in &self.percentiles {
                println!(
                    "  {:<18} {:>9.3}  {:>9.3}  {:>9.3}  {:>9.3}  {:>9.3}",
                    name, table.p50, table.p90, table.p95, table.p99, table.max
                );
            }
            println!();
        }
    }
}
