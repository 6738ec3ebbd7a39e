// Shared identifiers, the simulation event type and decision tracing

use serde::{Deserialize, Serialize};

use crate::sr_settlement::SettlementOutcome;

pub type SimTime = f64;
pub type UserId = u32;
pub type TxId = u64;
pub type Amount = f64;

pub const SECONDS_PER_HOUR: f64 = 3600.0;
pub const SECONDS_PER_DAY: f64 = 86_400.0;

// ============================================================================
// Events
// ============================================================================

/// A scheduled state transition for one transaction.
///
/// `time` is only used for queue ordering; handlers match on `kind`.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: SimTime,
    pub user: UserId,
    pub tx: TxId,
    pub amount: Amount,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Purchase,

    /// Settlement resolved on the ledger. In wait-on-chain mode the pending
    /// authorization is looked up by transaction id.
    Settlement {
        outcome: SettlementOutcome,
        approval_time: SimTime,
        /// When the capture was handed to the settlement network. Equals
        /// `approval_time` unless a pre-authorization completed first.
        submitted_at: SimTime,
        fraud: bool,
    },

    /// Hold reached its expiry timeout
    HoldExpiry,

    /// Pre-authorization finalised to its actual amount
    Completion {
        final_amount: Amount,
        approval_time: SimTime,
        fraud: bool,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Purchase => "purchase",
            EventKind::Settlement { .. } => "settlement",
            EventKind::HoldExpiry => "hold-expiry",
            EventKind::Completion { .. } => "completion",
        }
    }
}

// ============================================================================
// Decision Tracing
// ============================================================================

/// Outcomes reported by the kernel as it processes events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    Approved { tx: TxId, amount: Amount, auth_time: f64 },
    Declined { tx: TxId, reason: DeclineReason },
    TimedOut { tx: TxId, auth_time: f64 },
    Skipped { tx: TxId, available: Amount, amount: Amount },
    FraudAutoDeclined { tx: TxId, amount: Amount },
    HoldPlaced { tx: TxId, amount: Amount, outstanding: Amount },
    HoldEnlarged { tx: TxId, delta: Amount, outstanding: Amount },
    HoldReleased { tx: TxId, amount: Amount, outstanding: Amount },
    Settled { tx: TxId, amount: Amount, elapsed: f64, retries: u32 },
    SettlementFailed { tx: TxId, amount: Amount, retries: u32 },
    Exposure { tx: TxId, amount: Amount, start: SimTime, end: SimTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclineReason {
    SpendLimit,
    SettlementFailed,
}

/// Receives kernel decisions for debugging and analysis
pub trait TraceSink {
    fn record(&mut self, time: SimTime, user: UserId, event: TraceEvent);
}

/// Forwards decisions to the `log` facade at trace level
pub struct LogSink;

impl TraceSink for LogSink {
    #[inline]
    fn record(&mut self, time: SimTime, user: UserId, event: TraceEvent) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{:>10.3} u:{} {:?}", time, user, event);
        }
    }
}
