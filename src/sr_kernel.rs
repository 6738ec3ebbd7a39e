//! Per-run discrete-event simulation.
//!
//! One [`SimulationKernel`] executes one Monte Carlo run: it draws user
//! balances and a purchase timeline for the whole horizon, then pops events
//! in time order until the queue is empty, driving the authorization and
//! settlement state machine:
//!
//! ```text
//! Purchase ──► (wait-on-chain) ──────────────────────────► Settlement ──► approve / decline / timeout
//!    │
//!    └──────► (off-chain hold) approve ──► Hold ──► HoldExpiry
//!                                   │
//!                                   ├──► Completion ──► Settlement ──► confirm / exposure
//!                                   └─────────────────► Settlement ──► confirm / exposure
//! ```
//!
//! Pending state that crosses events (holds, deferred authorizations) lives
//! in flat maps keyed by transaction id and is removed when consumed.
//! Business outcomes such as insufficient funds or limit violations are
//! counted, never raised.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::sr_interface::{
    Amount, DeclineReason, Event, EventKind, LogSink, SimTime, TraceEvent, TraceSink, TxId,
    UserId, SECONDS_PER_DAY, SECONDS_PER_HOUR,
};
use crate::sr_queue::EventQueue;
use crate::sr_results::{ExposureEvent, RunResult, TimeBucket};
use crate::sr_rng::SeedRng;
use crate::sr_sampler::{chance, exponential, sample};
use crate::sr_scenario::{AuthMode, NetworkLatency, ScenarioSpec, SpendLimitPolicy};
use crate::sr_settlement::{simulate_settlement, SettlementOutcome};

const AMOUNT_EPSILON: f64 = 1e-9;

/// Run one Monte Carlo run with decisions traced to the `log` facade
pub fn run_once(spec: &ScenarioSpec, run_index: u32) -> RunResult {
    SimulationKernel::new(spec, run_index, LogSink).run()
}

// ============================================================================
// Run State
// ============================================================================

struct UserState {
    balance: Amount,
    held: Amount,
    active_holds: u32,
}

impl UserState {
    fn available(&self) -> Amount {
        self.balance - self.held
    }
}

struct Hold {
    user: UserId,
    amount: Amount,
}

/// Deferred wait-on-chain authorization
struct AuthorizationContext {
    request_time: SimTime,
    fraud: bool,
}

/// Sampled latencies of one authorization round trip
struct Legs {
    outbound: f64,
    issuer: f64,
    inbound: f64,
}

impl Legs {
    fn total(&self) -> f64 {
        self.outbound + self.issuer + self.inbound
    }
}

/// Per-user spend over day and timeslot buckets
#[derive(Default)]
struct SpendTracker {
    daily: HashMap<(UserId, u64), Amount>,
    timeslot: HashMap<(UserId, u64), Amount>,
}

impl SpendTracker {
    fn keys(policy: &SpendLimitPolicy, user: UserId, time: SimTime) -> ((UserId, u64), (UserId, u64)) {
        let day = (time / SECONDS_PER_DAY).floor().max(0.0) as u64;
        let slot_len = policy.timeslot_hours * SECONDS_PER_HOUR;
        let slot = (time / slot_len).floor().max(0.0) as u64;
        ((user, day), (user, slot))
    }

    fn allows(&self, policy: &SpendLimitPolicy, user: UserId, time: SimTime, amount: Amount) -> bool {
        if !policy.enabled {
            return true;
        }
        if let Some(cap) = policy.per_transaction {
            if amount > cap {
                return false;
            }
        }
        let (day_key, slot_key) = Self::keys(policy, user, time);
        if let Some(cap) = policy.per_user_daily {
            if self.daily.get(&day_key).copied().unwrap_or(0.0) + amount > cap {
                return false;
            }
        }
        if let Some(cap) = policy.per_user_timeslot {
            if self.timeslot.get(&slot_key).copied().unwrap_or(0.0) + amount > cap {
                return false;
            }
        }
        true
    }

    fn charge(&mut self, policy: &SpendLimitPolicy, user: UserId, time: SimTime, amount: Amount) {
        if !policy.enabled {
            return;
        }
        let (day_key, slot_key) = Self::keys(policy, user, time);
        *self.daily.entry(day_key).or_insert(0.0) += amount;
        *self.timeslot.entry(slot_key).or_insert(0.0) += amount;
    }
}

// ============================================================================
// Kernel
// ============================================================================

pub struct SimulationKernel<'a, S: TraceSink> {
    spec: &'a ScenarioSpec,
    rng: SeedRng,
    queue: EventQueue,
    sink: S,

    users: Vec<UserState>,
    holds: HashMap<TxId, Hold>,
    pending_auths: HashMap<TxId, AuthorizationContext>,
    spend: SpendTracker,
    outstanding_holds: Amount,
    exposure_by_user: Vec<Amount>,
    next_tx: TxId,

    bucket_width: f64,
    result: RunResult,
}

impl<'a, S: TraceSink> SimulationKernel<'a, S> {
    pub fn new(spec: &'a ScenarioSpec, run_index: u32, sink: S) -> Self {
        let buckets = spec.time_buckets.max(1);
        let bucket_width = spec.horizon_sec() / buckets as f64;
        let time_series = (0..buckets)
            .map(|i| TimeBucket {
                time_sec: i as f64 * bucket_width,
                ..TimeBucket::default()
            })
            .collect();

        Self {
            spec,
            rng: SeedRng::for_run(&spec.seed, run_index),
            queue: EventQueue::new(),
            sink,
            users: Vec::with_capacity(spec.users.count as usize),
            holds: HashMap::new(),
            pending_auths: HashMap::new(),
            spend: SpendTracker::default(),
            outstanding_holds: 0.0,
            exposure_by_user: vec![0.0; spec.users.count as usize],
            next_tx: 0,
            bucket_width,
            result: RunResult {
                run_index,
                time_series,
                ..RunResult::default()
            },
        }
    }

    /// Execute the run to completion
    pub fn run(mut self) -> RunResult {
        self.bootstrap();
        let scheduled = self.queue.len();

        while let Some(event) = self.queue.pop() {
            trace!(
                "run {} t={:.3} {} user={} tx={}",
                self.result.run_index,
                event.time,
                event.kind.name(),
                event.user,
                event.tx
            );
            self.dispatch(event);
        }

        let c = &self.result.counters;
        debug!(
            "run {} finished: {} purchases, {} approved, {} declined, {} timed out, {} skipped, {} exposures",
            self.result.run_index,
            scheduled,
            c.approvals,
            c.declines,
            c.timeouts,
            c.insufficient_funds_skipped,
            self.result.exposure_events.len()
        );

        self.result.exposure_per_user = self
            .exposure_by_user
            .iter()
            .copied()
            .filter(|amount| *amount > 0.0)
            .collect();
        self.result
    }

    /// Draw balances and pre-generate every purchase in the horizon
    fn bootstrap(&mut self) {
        let spec = self.spec;
        let population = &spec.users;
        let horizon = spec.horizon_sec();
        let base_rate = population.purchase_rate_per_hour / SECONDS_PER_HOUR;

        for user in 0..population.count {
            let balance = sample(&mut self.rng, &population.balance);
            self.users.push(UserState {
                balance,
                held: 0.0,
                active_holds: 0,
            });

            let mut time = 0.0;
            loop {
                let mut rate = base_rate;
                if population.burstiness.enabled
                    && chance(&mut self.rng, population.burstiness.burst_probability)
                {
                    rate *= population.burstiness.burst_multiplier;
                }
                time += exponential(&mut self.rng, rate);
                if !(time < horizon) {
                    break;
                }

                let amount = sample(&mut self.rng, &population.ticket);
                let tx = self.next_tx_id();
                self.queue.push(Event {
                    time,
                    user,
                    tx,
                    amount,
                    kind: EventKind::Purchase,
                });
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let Event {
            time,
            user,
            tx,
            amount,
            kind,
        } = event;

        match kind {
            EventKind::Purchase => self.handle_purchase(time, user, tx, amount),
            EventKind::Completion {
                final_amount,
                approval_time,
                fraud,
            } => self.handle_completion(time, user, tx, amount, final_amount, approval_time, fraud),
            EventKind::HoldExpiry => self.handle_hold_expiry(time, tx),
            EventKind::Settlement {
                outcome,
                approval_time,
                submitted_at,
                fraud,
            } => match self.spec.auth_mode {
                AuthMode::WaitOnChain => self.settle_wait_on_chain(time, user, tx, amount, outcome),
                AuthMode::OffChainHold => self.settle_off_chain(
                    time,
                    user,
                    tx,
                    amount,
                    outcome,
                    approval_time,
                    submitted_at,
                    fraud,
                ),
            },
        }
    }

    // ------------------------------------------------------------------------
    // Purchase
    // ------------------------------------------------------------------------

    fn handle_purchase(&mut self, time: SimTime, user: UserId, tx: TxId, amount: Amount) {
        self.result.counters.purchase_events += 1;

        let available = self.users[user as usize].available();
        if available <= 0.0 {
            self.skip_insufficient(time, user, tx, amount);
            return;
        }

        let mut amount = amount;
        let mut fraud = false;
        let spec = self.spec;
        let policy = &spec.fraud;
        if policy.enabled && chance(&mut self.rng, policy.attempt_rate) {
            fraud = true;
            self.result.counters.fraud_attempts += 1;
            amount *= sample(&mut self.rng, &policy.amount_multiplier);

            if chance(&mut self.rng, policy.auto_decline_rate) {
                self.result.counters.fraud_auto_declined += 1;
                self.sink
                    .record(time, user, TraceEvent::FraudAutoDeclined { tx, amount });
                return;
            }
        }

        let legs = self.sample_legs();
        match self.spec.auth_mode {
            AuthMode::WaitOnChain => {
                let issuer_done = time + legs.outbound + legs.issuer;
                let outcome = self.settle_from(issuer_done);
                self.pending_auths.insert(
                    tx,
                    AuthorizationContext {
                        request_time: time,
                        fraud,
                    },
                );
                self.queue.push(Event {
                    time: issuer_done + outcome.elapsed_sec,
                    user,
                    tx,
                    amount,
                    kind: EventKind::Settlement {
                        outcome,
                        approval_time: issuer_done,
                        submitted_at: issuer_done,
                        fraud,
                    },
                });
            }
            AuthMode::OffChainHold => self.authorize_off_chain(time, user, tx, amount, fraud, legs),
        }
    }

    fn authorize_off_chain(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        fraud: bool,
        legs: Legs,
    ) {
        let auth_time = legs.total();
        if auth_time > self.spec.auth_timeout_sec {
            self.record_timeout(time, user, tx, auth_time);
            return;
        }

        if !self.spend.allows(&self.spec.spend_limits, user, time, amount) {
            self.record_limit_decline(time, user, tx);
            return;
        }

        if self.users[user as usize].available() < amount {
            self.skip_insufficient(time, user, tx, amount);
            return;
        }

        let approval_time = time + auth_time;
        self.record_approval(time, user, tx, amount, auth_time, fraud);

        if self.spec.holds.enabled {
            self.place_hold(approval_time, user, tx, amount);
            self.queue.push(Event {
                time: approval_time + self.spec.holds.hold_expiry_sec,
                user,
                tx,
                amount,
                kind: EventKind::HoldExpiry,
            });
        }

        let spec = self.spec;
        let pre_auth = &spec.pre_auth;
        if pre_auth.enabled {
            let delay = sample(&mut self.rng, &pre_auth.completion_delay);
            let multiplier = sample(&mut self.rng, &pre_auth.final_amount_multiplier);
            self.queue.push(Event {
                time: approval_time + delay,
                user,
                tx,
                amount,
                kind: EventKind::Completion {
                    final_amount: amount * multiplier,
                    approval_time,
                    fraud,
                },
            });
        } else {
            let outcome = self.settle_from(approval_time);
            self.queue.push(Event {
                time: approval_time + outcome.elapsed_sec,
                user,
                tx,
                amount,
                kind: EventKind::Settlement {
                    outcome,
                    approval_time,
                    submitted_at: approval_time,
                    fraud,
                },
            });
        }
    }

    // ------------------------------------------------------------------------
    // Completion, hold expiry
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_completion(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        authorized: Amount,
        final_amount: Amount,
        approval_time: SimTime,
        fraud: bool,
    ) {
        self.result.counters.completions += 1;
        if (final_amount - authorized).abs() > AMOUNT_EPSILON {
            self.result.counters.pre_auth_mismatches += 1;
        }

        let mut settle_amount = final_amount;
        let delta = final_amount - authorized;
        if delta > AMOUNT_EPSILON {
            // without a successful increment only the authorized amount is captured
            settle_amount = authorized;

            if self.spec.pre_auth.allow_incremental {
                self.result.counters.incremental_attempts += 1;
                let fits = self.users[user as usize].available() >= delta;
                if fits && self.spend.allows(&self.spec.spend_limits, user, time, delta) {
                    self.result.counters.incremental_successes += 1;
                    self.spend.charge(&self.spec.spend_limits, user, time, delta);
                    self.enlarge_hold(time, user, tx, delta);
                    if fraud {
                        self.result.counters.fraud_exposure += delta;
                    }
                    settle_amount = final_amount;
                }
            }
        }

        let legs = self.sample_legs();
        let submit_at = time + legs.total();
        let outcome = self.settle_from(submit_at);
        self.queue.push(Event {
            time: submit_at + outcome.elapsed_sec,
            user,
            tx,
            amount: settle_amount,
            kind: EventKind::Settlement {
                outcome,
                approval_time,
                submitted_at: submit_at,
                fraud,
            },
        });
    }

    fn handle_hold_expiry(&mut self, time: SimTime, tx: TxId) {
        if self.release_hold(time, tx) {
            self.result.counters.hold_expiries += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------------

    fn settle_wait_on_chain(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        outcome: SettlementOutcome,
    ) {
        let Some(context) = self.pending_auths.remove(&tx) else {
            return;
        };

        let auth_time = (time - context.request_time) + self.sample_return_leg();
        self.record_settlement_outcome(time, user, tx, amount, &outcome, outcome.confirmed());

        if auth_time > self.spec.auth_timeout_sec {
            self.record_timeout(context.request_time, user, tx, auth_time);
            return;
        }
        if outcome.gave_up() {
            self.record_decline(context.request_time, user, tx, DeclineReason::SettlementFailed);
            return;
        }
        if !self
            .spend
            .allows(&self.spec.spend_limits, user, context.request_time, amount)
        {
            self.record_limit_decline(context.request_time, user, tx);
            return;
        }
        if self.users[user as usize].balance < amount {
            self.skip_insufficient(time, user, tx, amount);
            return;
        }

        self.record_approval(context.request_time, user, tx, amount, auth_time, context.fraud);
        self.debit(time, user, tx, amount, time - context.request_time, outcome.retries);
        if context.fraud {
            self.result.counters.fraud_loss += amount;
        }
    }

    /// Settlement time and the SLA run from submission. Before a
    /// pre-authorization completes its hold covers the issuer, so the exposure
    /// window opens at submission too.
    #[allow(clippy::too_many_arguments)]
    fn settle_off_chain(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        outcome: SettlementOutcome,
        approval_time: SimTime,
        submitted_at: SimTime,
        fraud: bool,
    ) {
        let settle_time = time - submitted_at;
        let confirmed = outcome.confirmed() && self.users[user as usize].balance >= amount;
        self.record_settlement_outcome(time, user, tx, amount, &outcome, confirmed);

        if confirmed {
            self.debit(time, user, tx, amount, settle_time, outcome.retries);
            if fraud {
                self.result.counters.fraud_loss += amount;
            }
        }

        if !confirmed || settle_time > self.spec.settlement_sla_sec {
            let start = submitted_at.max(approval_time);
            let window_end = start + self.spec.settlement.max_settle_window_sec;
            let end = time.min(window_end).max(start);
            self.record_exposure(user, tx, amount, start, end);
        }

        self.release_hold(time, tx);
    }

    fn settle_from(&mut self, start: SimTime) -> SettlementOutcome {
        simulate_settlement(
            &mut self.rng,
            &self.spec.settlement,
            &self.spec.outage,
            start,
        )
    }

    // ------------------------------------------------------------------------
    // Latency
    // ------------------------------------------------------------------------

    fn sample_legs(&mut self) -> Legs {
        let (outbound, inbound) = match &self.spec.network {
            NetworkLatency::Combined { rtt } => {
                let half = sample(&mut self.rng, rtt) / 2.0;
                (half, half)
            }
            NetworkLatency::PerLeg {
                merchant_to_acquirer,
                acquirer_to_issuer,
                issuer_to_acquirer,
                acquirer_to_merchant,
            } => {
                let outbound = sample(&mut self.rng, merchant_to_acquirer)
                    + sample(&mut self.rng, acquirer_to_issuer);
                let inbound = sample(&mut self.rng, issuer_to_acquirer)
                    + sample(&mut self.rng, acquirer_to_merchant);
                (outbound, inbound)
            }
        };
        let issuer = sample(&mut self.rng, &self.spec.issuer_processing);
        Legs {
            outbound,
            issuer,
            inbound,
        }
    }

    fn sample_return_leg(&mut self) -> f64 {
        match &self.spec.network {
            NetworkLatency::Combined { rtt } => sample(&mut self.rng, rtt) / 2.0,
            NetworkLatency::PerLeg {
                issuer_to_acquirer,
                acquirer_to_merchant,
                ..
            } => {
                sample(&mut self.rng, issuer_to_acquirer)
                    + sample(&mut self.rng, acquirer_to_merchant)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Holds
    // ------------------------------------------------------------------------

    fn place_hold(&mut self, time: SimTime, user: UserId, tx: TxId, amount: Amount) {
        let state = &mut self.users[user as usize];
        state.held += amount;
        state.active_holds += 1;
        let outstanding = state.held;
        self.outstanding_holds += amount;
        self.holds.insert(tx, Hold { user, amount });

        self.result.pending_hold_samples.push(self.outstanding_holds);
        self.sink.record(
            time,
            user,
            TraceEvent::HoldPlaced {
                tx,
                amount,
                outstanding,
            },
        );
    }

    fn enlarge_hold(&mut self, time: SimTime, user: UserId, tx: TxId, delta: Amount) {
        let Some(hold) = self.holds.get_mut(&tx) else {
            return;
        };
        hold.amount += delta;
        let state = &mut self.users[user as usize];
        state.held += delta;
        let outstanding = state.held;
        self.outstanding_holds += delta;
        self.sink.record(
            time,
            user,
            TraceEvent::HoldEnlarged {
                tx,
                delta,
                outstanding,
            },
        );
    }

    /// Release a hold if it is still active
    fn release_hold(&mut self, time: SimTime, tx: TxId) -> bool {
        let Some(hold) = self.holds.remove(&tx) else {
            return false;
        };
        let state = &mut self.users[hold.user as usize];
        state.held = (state.held - hold.amount).max(0.0);
        state.active_holds = state.active_holds.saturating_sub(1);
        if state.active_holds == 0 {
            state.held = 0.0;
        }
        let outstanding = state.held;
        self.outstanding_holds = (self.outstanding_holds - hold.amount).max(0.0);
        self.sink.record(
            time,
            hold.user,
            TraceEvent::HoldReleased {
                tx,
                amount: hold.amount,
                outstanding,
            },
        );
        true
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    fn next_tx_id(&mut self) -> TxId {
        let tx = self.next_tx;
        self.next_tx += 1;
        tx
    }

    fn bucket(&mut self, time: SimTime) -> &mut TimeBucket {
        let index = self.bucket_index(time);
        &mut self.result.time_series[index]
    }

    fn bucket_index(&self, time: SimTime) -> usize {
        let last = self.result.time_series.len() - 1;
        if !(time > 0.0) || self.bucket_width <= 0.0 {
            return 0;
        }
        ((time / self.bucket_width).floor() as usize).min(last)
    }

    fn skip_insufficient(&mut self, time: SimTime, user: UserId, tx: TxId, amount: Amount) {
        let state = &self.users[user as usize];
        let available = state.available();
        if state.balance >= amount && available < amount {
            self.result.counters.overspend_prevented += 1;
        }
        self.result.counters.insufficient_funds_skipped += 1;
        self.sink.record(
            time,
            user,
            TraceEvent::Skipped {
                tx,
                available,
                amount,
            },
        );
    }

    fn record_approval(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        auth_time: f64,
        fraud: bool,
    ) {
        let counters = &mut self.result.counters;
        counters.approvals += 1;
        if fraud {
            counters.fraud_approved += 1;
            counters.fraud_exposure += amount;
        }
        self.result.auth_times.push(auth_time);
        self.spend.charge(&self.spec.spend_limits, user, time, amount);
        self.bucket(time).approvals += 1.0;
        self.sink.record(
            time,
            user,
            TraceEvent::Approved {
                tx,
                amount,
                auth_time,
            },
        );
    }

    fn record_timeout(&mut self, time: SimTime, user: UserId, tx: TxId, auth_time: f64) {
        self.result.counters.timeouts += 1;
        self.bucket(time).timeouts += 1.0;
        self.sink
            .record(time, user, TraceEvent::TimedOut { tx, auth_time });
    }

    fn record_decline(&mut self, time: SimTime, user: UserId, tx: TxId, reason: DeclineReason) {
        self.result.counters.declines += 1;
        self.bucket(time).declines += 1.0;
        self.sink
            .record(time, user, TraceEvent::Declined { tx, reason });
    }

    fn record_limit_decline(&mut self, time: SimTime, user: UserId, tx: TxId) {
        self.result.counters.limit_declines += 1;
        self.record_decline(time, user, tx, DeclineReason::SpendLimit);
    }

    /// Every resolved settlement counts exactly once as confirmed or failed
    fn record_settlement_outcome(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        outcome: &SettlementOutcome,
        confirmed: bool,
    ) {
        self.result.retries.push(outcome.retries);
        if confirmed {
            self.result.counters.settlements_confirmed += 1;
            return;
        }
        self.result.counters.settlements_failed += 1;
        self.sink.record(
            time,
            user,
            TraceEvent::SettlementFailed {
                tx,
                amount,
                retries: outcome.retries,
            },
        );
    }

    /// Settled purchase: the balance is debited exactly once here
    fn debit(
        &mut self,
        time: SimTime,
        user: UserId,
        tx: TxId,
        amount: Amount,
        settlement_time: f64,
        retries: u32,
    ) {
        self.users[user as usize].balance -= amount;
        self.result.counters.total_spend += amount;
        self.result.settlement_times.push(settlement_time);
        self.sink.record(
            time,
            user,
            TraceEvent::Settled {
                tx,
                amount,
                elapsed: settlement_time,
                retries,
            },
        );
    }

    fn record_exposure(&mut self, user: UserId, tx: TxId, amount: Amount, start: SimTime, end: SimTime) {
        let first = self.bucket_index(start);
        let last = self.bucket_index(end);
        for bucket in &mut self.result.time_series[first..=last] {
            bucket.exposure += amount;
        }
        self.exposure_by_user[user as usize] += amount;
        self.result.exposure_events.push(ExposureEvent {
            user,
            tx,
            amount,
            start_sec: start,
            end_sec: end,
        });
        self.sink.record(
            end,
            user,
            TraceEvent::Exposure {
                tx,
                amount,
                start,
                end,
            },
        );
    }
}
