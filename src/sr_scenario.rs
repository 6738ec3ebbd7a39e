//! Scenario configuration.
//!
//! A [`ScenarioSpec`] is read-only for the lifetime of a run set. It can be
//! exchanged losslessly as JSON (camelCase field names) and loaded from the
//! YAML scenario files used by the runner. Every import path validates the
//! shape before anything is simulated.

use serde::{Deserialize, Serialize};

use crate::sr_error::ConfigError;
use crate::sr_interface::SECONDS_PER_HOUR;
use crate::sr_sampler::DistributionSpec;

pub const DEFAULT_TIME_BUCKETS: usize = 60;

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    /// Simulated horizon for purchase arrivals (hours)
    pub horizon_hours: f64,

    /// Number of independent Monte Carlo runs
    pub runs: u32,

    /// Scenario seed; run `i` uses `"{seed}-{i}"`
    pub seed: String,

    pub auth_mode: AuthMode,

    /// Authorization latency above which the attempt times out
    pub auth_timeout_sec: f64,

    /// Card network round trip, combined or per leg
    pub network: NetworkLatency,

    /// Issuer processing time
    pub issuer_processing: DistributionSpec,

    pub settlement: SettlementSpec,

    pub outage: OutageSpec,

    pub users: UserPopulation,

    pub holds: HoldPolicy,

    pub pre_auth: PreAuthPolicy,

    pub fraud: FraudPolicy,

    pub spend_limits: SpendLimitPolicy,

    /// Settlement later than this after approval counts as exposure
    pub settlement_sla_sec: f64,

    /// Number of buckets in the per-run time series
    #[serde(default = "default_time_buckets")]
    pub time_buckets: usize,
}

fn default_time_buckets() -> usize {
    DEFAULT_TIME_BUCKETS
}

/// When the approve/decline decision is made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    /// Decision deferred until the settlement transaction resolves
    WaitOnChain,

    /// Decision made immediately, funds reserved by a hold until settlement
    OffChainHold,
}

// ============================================================================
// Network Latency
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NetworkLatency {
    /// One round-trip sample, split evenly between directions
    #[serde(rename_all = "camelCase")]
    Combined { rtt: DistributionSpec },

    /// Four independently sampled directional legs
    #[serde(rename_all = "camelCase")]
    PerLeg {
        merchant_to_acquirer: DistributionSpec,
        acquirer_to_issuer: DistributionSpec,
        issuer_to_acquirer: DistributionSpec,
        acquirer_to_merchant: DistributionSpec,
    },
}

// ============================================================================
// Settlement Network
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSpec {
    /// Mean time between ledger closes
    pub ledger_interval_mean_sec: f64,

    /// Uniform jitter around the mean interval
    pub ledger_interval_jitter_sec: f64,

    /// Delay from submission request to the transaction reaching the network
    pub submission_delay: DistributionSpec,

    /// Chance the transaction lands in the next ledger close
    pub inclusion_probability: f64,

    pub max_retries: u32,

    pub backoff_base_sec: f64,

    pub backoff_multiplier: f64,

    /// Give up (and cap exposure windows) after this long
    pub max_settle_window_sec: f64,
}

/// Window during which the settlement network is degraded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutageSpec {
    pub enabled: bool,
    pub start_hour: f64,
    pub duration_hours: f64,

    /// Submission delay multiplier inside the window (>= 1)
    pub delay_multiplier: f64,

    /// Inclusion probability multiplier inside the window (0..=1)
    pub inclusion_multiplier: f64,
}

impl OutageSpec {
    pub fn contains(&self, time_sec: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let start = self.start_hour * SECONDS_PER_HOUR;
        let end = (self.start_hour + self.duration_hours) * SECONDS_PER_HOUR;
        time_sec >= start && time_sec < end
    }
}

// ============================================================================
// User Population
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPopulation {
    pub count: u32,

    /// Initial balance per user
    pub balance: DistributionSpec,

    /// Mean purchases per user per hour
    pub purchase_rate_per_hour: f64,

    /// Purchase amount
    pub ticket: DistributionSpec,

    pub burstiness: Burstiness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Burstiness {
    pub enabled: bool,

    /// Chance an inter-arrival draw uses the burst rate
    pub burst_probability: f64,

    /// Rate multiplier during a burst
    pub burst_multiplier: f64,
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldPolicy {
    pub enabled: bool,

    /// Hold is released after this long even without settlement
    pub hold_expiry_sec: f64,
}

/// Two-phase authorization: estimated amount now, actual amount later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAuthPolicy {
    pub enabled: bool,

    /// Delay from approval to completion
    pub completion_delay: DistributionSpec,

    /// Final amount = authorized amount x sample
    pub final_amount_multiplier: DistributionSpec,

    /// Allow growing the hold when the final amount is larger
    pub allow_incremental: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudPolicy {
    pub enabled: bool,

    /// Chance a purchase is fraudulent
    pub attempt_rate: f64,

    /// Fraudulent amount = ticket x sample
    pub amount_multiplier: DistributionSpec,

    /// Chance a fraudulent attempt is caught before any latency
    pub auto_decline_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendLimitPolicy {
    pub enabled: bool,
    pub per_transaction: Option<f64>,
    pub per_user_daily: Option<f64>,
    pub per_user_timeslot: Option<f64>,
    pub timeslot_hours: f64,
}

// ============================================================================
// Construction, Validation and Interchange
// ============================================================================

impl ScenarioSpec {
    pub fn horizon_sec(&self) -> f64 {
        self.horizon_hours * SECONDS_PER_HOUR
    }

    /// A paired counterfactual run set is needed to price spend limits
    pub fn needs_counterfactual(&self) -> bool {
        self.fraud.enabled && self.spend_limits.enabled
    }

    pub fn without_spend_limits(&self) -> Self {
        let mut spec = self.clone();
        spec.spend_limits.enabled = false;
        spec
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let spec: ScenarioSpec = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let spec: ScenarioSpec = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// BLAKE3 digest of the canonical JSON form
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("horizonHours", self.horizon_hours)?;
        if self.runs == 0 {
            return Err(ConfigError::invalid("runs", "must be at least 1"));
        }
        positive("authTimeoutSec", self.auth_timeout_sec)?;
        non_negative("settlementSlaSec", self.settlement_sla_sec)?;
        if self.time_buckets == 0 {
            return Err(ConfigError::invalid("timeBuckets", "must be at least 1"));
        }

        match &self.network {
            NetworkLatency::Combined { rtt } => distribution("network.rtt", rtt)?,
            NetworkLatency::PerLeg {
                merchant_to_acquirer,
                acquirer_to_issuer,
                issuer_to_acquirer,
                acquirer_to_merchant,
            } => {
                distribution("network.merchantToAcquirer", merchant_to_acquirer)?;
                distribution("network.acquirerToIssuer", acquirer_to_issuer)?;
                distribution("network.issuerToAcquirer", issuer_to_acquirer)?;
                distribution("network.acquirerToMerchant", acquirer_to_merchant)?;
            }
        }
        distribution("issuerProcessing", &self.issuer_processing)?;

        let s = &self.settlement;
        positive("settlement.ledgerIntervalMeanSec", s.ledger_interval_mean_sec)?;
        non_negative("settlement.ledgerIntervalJitterSec", s.ledger_interval_jitter_sec)?;
        distribution("settlement.submissionDelay", &s.submission_delay)?;
        probability("settlement.inclusionProbability", s.inclusion_probability)?;
        non_negative("settlement.backoffBaseSec", s.backoff_base_sec)?;
        non_negative("settlement.backoffMultiplier", s.backoff_multiplier)?;
        positive("settlement.maxSettleWindowSec", s.max_settle_window_sec)?;

        let o = &self.outage;
        non_negative("outage.startHour", o.start_hour)?;
        non_negative("outage.durationHours", o.duration_hours)?;
        non_negative("outage.delayMultiplier", o.delay_multiplier)?;
        non_negative("outage.inclusionMultiplier", o.inclusion_multiplier)?;

        let u = &self.users;
        if u.count == 0 {
            return Err(ConfigError::invalid("users.count", "must be at least 1"));
        }
        distribution("users.balance", &u.balance)?;
        non_negative("users.purchaseRatePerHour", u.purchase_rate_per_hour)?;
        distribution("users.ticket", &u.ticket)?;
        probability("users.burstiness.burstProbability", u.burstiness.burst_probability)?;
        non_negative("users.burstiness.burstMultiplier", u.burstiness.burst_multiplier)?;

        non_negative("holds.holdExpirySec", self.holds.hold_expiry_sec)?;

        distribution("preAuth.completionDelay", &self.pre_auth.completion_delay)?;
        distribution(
            "preAuth.finalAmountMultiplier",
            &self.pre_auth.final_amount_multiplier,
        )?;

        probability("fraud.attemptRate", self.fraud.attempt_rate)?;
        distribution("fraud.amountMultiplier", &self.fraud.amount_multiplier)?;
        probability("fraud.autoDeclineRate", self.fraud.auto_decline_rate)?;

        let l = &self.spend_limits;
        for (field, cap) in [
            ("spendLimits.perTransaction", l.per_transaction),
            ("spendLimits.perUserDaily", l.per_user_daily),
            ("spendLimits.perUserTimeslot", l.per_user_timeslot),
        ] {
            if let Some(cap) = cap {
                non_negative(field, cap)?;
            }
        }
        positive("spendLimits.timeslotHours", l.timeslot_hours)?;

        Ok(())
    }

    /// Short human-readable description of the scenario
    pub fn summary(&self) -> String {
        let on_off = |enabled: bool| if enabled { "on" } else { "off" };
        let mode = match self.auth_mode {
            AuthMode::WaitOnChain => "wait-on-chain",
            AuthMode::OffChainHold => "off-chain hold",
        };
        let network = match self.network {
            NetworkLatency::Combined { .. } => "combined RTT",
            NetworkLatency::PerLeg { .. } => "per-leg latency",
        };
        format!(
            "{} users | {}h horizon | {} | {} | timeout {}s | holds {} | pre-auth {} | fraud {} | spend limits {} | outage {} | {} runs | seed \"{}\"",
            self.users.count,
            self.horizon_hours,
            mode,
            network,
            self.auth_timeout_sec,
            on_off(self.holds.enabled),
            on_off(self.pre_auth.enabled),
            on_off(self.fraud.enabled),
            on_off(self.spend_limits.enabled),
            on_off(self.outage.enabled),
            self.runs,
            self.seed,
        )
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a finite number, got {}", value)))
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {}", value)))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must not be negative, got {}", value)))
    }
}

fn probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within [0, 1], got {}", value)))
    }
}

/// Degenerate (non-positive) parameters are allowed and sample as zero
fn distribution(field: &'static str, spec: &DistributionSpec) -> Result<(), ConfigError> {
    finite(field, spec.mean)?;
    finite(field, spec.p95)
}

// ============================================================================
// Default Implementations
// ============================================================================

impl Default for ScenarioSpec {
    fn default() -> Self {
        Self {
            horizon_hours: 1.0,
            runs: 100,
            seed: "deterministic".to_string(),
            auth_mode: AuthMode::OffChainHold,
            auth_timeout_sec: 2.0,
            network: NetworkLatency::default(),
            issuer_processing: DistributionSpec::lognormal(0.1, 0.2),
            settlement: SettlementSpec::default(),
            outage: OutageSpec::default(),
            users: UserPopulation::default(),
            holds: HoldPolicy::default(),
            pre_auth: PreAuthPolicy::default(),
            fraud: FraudPolicy::default(),
            spend_limits: SpendLimitPolicy::default(),
            settlement_sla_sec: 30.0,
            time_buckets: DEFAULT_TIME_BUCKETS,
        }
    }
}

impl Default for NetworkLatency {
    fn default() -> Self {
        Self::Combined {
            rtt: DistributionSpec::lognormal(0.12, 0.25),
        }
    }
}

impl Default for SettlementSpec {
    fn default() -> Self {
        Self {
            ledger_interval_mean_sec: 5.0,
            ledger_interval_jitter_sec: 1.0,
            submission_delay: DistributionSpec::lognormal(1.0, 2.5),
            inclusion_probability: 0.9,
            max_retries: 3,
            backoff_base_sec: 2.0,
            backoff_multiplier: 2.0,
            max_settle_window_sec: 60.0,
        }
    }
}

impl Default for OutageSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 0.5,
            duration_hours: 0.25,
            delay_multiplier: 3.0,
            inclusion_multiplier: 0.5,
        }
    }
}

impl Default for UserPopulation {
    fn default() -> Self {
        Self {
            count: 50,
            balance: DistributionSpec::lognormal(70.0, 200.0),
            purchase_rate_per_hour: 1.15,
            ticket: DistributionSpec::lognormal(50.0, 150.0),
            burstiness: Burstiness::default(),
        }
    }
}

impl Default for Burstiness {
    fn default() -> Self {
        Self {
            enabled: false,
            burst_probability: 0.1,
            burst_multiplier: 5.0,
        }
    }
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            hold_expiry_sec: 86_400.0,
        }
    }
}

impl Default for PreAuthPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            completion_delay: DistributionSpec::gamma(1800.0, 5400.0),
            final_amount_multiplier: DistributionSpec::lognormal(1.05, 1.25),
            allow_incremental: true,
        }
    }
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            attempt_rate: 0.01,
            amount_multiplier: DistributionSpec::lognormal(3.0, 8.0),
            auto_decline_rate: 0.6,
        }
    }
}

impl Default for SpendLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            per_transaction: Some(500.0),
            per_user_daily: Some(1500.0),
            per_user_timeslot: Some(600.0),
            timeslot_hours: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let spec = ScenarioSpec::default();
        spec.validate().unwrap();
        assert_eq!(spec.horizon_sec(), 3600.0);
        assert!(!spec.needs_counterfactual());
    }

    #[test]
    fn test_json_round_trip() {
        let mut spec = ScenarioSpec::default();
        spec.auth_mode = AuthMode::WaitOnChain;
        spec.network = NetworkLatency::PerLeg {
            merchant_to_acquirer: DistributionSpec::lognormal(0.03, 0.06),
            acquirer_to_issuer: DistributionSpec::gamma(0.04, 0.09),
            issuer_to_acquirer: DistributionSpec::lognormal(0.04, 0.08),
            acquirer_to_merchant: DistributionSpec::lognormal(0.03, 0.05),
        };
        spec.spend_limits.per_user_daily = None;

        let json = spec.to_json().unwrap();
        assert!(json.contains("\"authMode\": \"waitOnChain\""));
        assert!(json.contains("\"mode\": \"perLeg\""));

        let parsed = ScenarioSpec::from_json(&json).unwrap();
        assert_eq!(parsed, spec);
        assert_eq!(parsed.fingerprint(), spec.fingerprint());
    }

    #[test]
    fn test_time_buckets_optional() {
        let mut value = serde_json::to_value(ScenarioSpec::default()).unwrap();
        value.as_object_mut().unwrap().remove("timeBuckets");
        let parsed = ScenarioSpec::from_json(&value.to_string()).unwrap();
        assert_eq!(parsed.time_buckets, DEFAULT_TIME_BUCKETS);
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut value = serde_json::to_value(ScenarioSpec::default()).unwrap();
        value.as_object_mut().unwrap().remove("settlement");
        let err = ScenarioSpec::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_malformed_values_rejected() {
        let mut spec = ScenarioSpec::default();
        spec.settlement.inclusion_probability = 1.5;
        match spec.validate() {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "settlement.inclusionProbability")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut spec = ScenarioSpec::default();
        spec.users.count = 0;
        assert!(spec.validate().is_err());

        let mut spec = ScenarioSpec::default();
        spec.horizon_hours = f64::NAN;
        assert!(spec.validate().is_err());

        let mut spec = ScenarioSpec::default();
        spec.issuer_processing.p95 = f64::INFINITY;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_degenerate_distribution_accepted() {
        let mut spec = ScenarioSpec::default();
        spec.issuer_processing = DistributionSpec::lognormal(0.0, 0.0);
        spec.validate().unwrap();
    }

    #[test]
    fn test_yaml_scenario() {
        let yaml = serde_yaml::to_string(&ScenarioSpec::default()).unwrap();
        let parsed = ScenarioSpec::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, ScenarioSpec::default());
    }

    #[test]
    fn test_outage_window() {
        let outage = OutageSpec {
            enabled: true,
            start_hour: 1.0,
            duration_hours: 0.5,
            ..OutageSpec::default()
        };
        assert!(!outage.contains(3599.0));
        assert!(outage.contains(3600.0));
        assert!(outage.contains(5399.0));
        assert!(!outage.contains(5400.0));

        let disabled = OutageSpec { enabled: false, ..outage };
        assert!(!disabled.contains(4000.0));
    }

    #[test]
    fn test_counterfactual_spec() {
        let mut spec = ScenarioSpec::default();
        spec.fraud.enabled = true;
        spec.spend_limits.enabled = true;
        assert!(spec.needs_counterfactual());
        let baseline = spec.without_spend_limits();
        assert!(!baseline.spend_limits.enabled);
        assert_ne!(baseline.fingerprint(), spec.fingerprint());
    }

    #[test]
    fn test_summary_mentions_mode() {
        let summary = ScenarioSpec::default().summary();
        assert!(summary.contains("50 users"));
        assert!(summary.contains("off-chain hold"));
        assert!(summary.contains("seed \"deterministic\""));
    }
}
