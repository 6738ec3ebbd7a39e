//! # settle_risk - Card Authorization and Settlement Risk Simulation
//!
//! A discrete-event Monte Carlo simulator for a payment flow in which a card
//! authorization is followed by an asynchronous blockchain settlement. Given a
//! [`ScenarioSpec`] it estimates approval/decline/timeout rates, settlement
//! latency, financial exposure windows and fraud loss.
//!
//! ## Core Components
//!
//! - **SeedRng / sampler**: string-seeded deterministic generator and
//!   mean/p95-parameterised lognormal and gamma distributions
//! - **SimulationKernel**: one run's event loop over purchases, holds,
//!   completions and settlements
//! - **Aggregator**: merges raw run samples into an [`AggregateResult`]
//! - **Orchestrator**: fans runs out over worker threads and reports progress
//!
//! ## Usage
//!
//! ```no_run
//! use settle_risk::{Orchestrator, ScenarioSpec};
//!
//! let mut spec = ScenarioSpec::default();
//! spec.runs = 200;
//! spec.fraud.enabled = true;
//!
//! let mut orchestrator = Orchestrator::new();
//! let result = orchestrator
//!     .run(&spec, |p| println!("{:.0}%", p.fraction() * 100.0))
//!     .unwrap();
//! result.print_summary();
//! ```
//!
//! Scenario files are run with the `scenario_runner` binary in `simulator/`.

// Configuration and shared types
pub mod sr_error;
pub mod sr_interface;
pub mod sr_scenario;

// Randomness
pub mod sr_rng;
pub mod sr_sampler;

// Simulation
pub mod sr_kernel;
pub mod sr_queue;
pub mod sr_settlement;

// Results
pub mod sr_aggregate;
pub mod sr_results;
pub mod sr_stats;

pub mod sr_orchestrator;

// Re-export commonly used types
pub use sr_aggregate::{aggregate, aggregate_with_counterfactual, with_counterfactual};
pub use sr_error::{ConfigError, SimError};
pub use sr_interface::{LogSink, TraceEvent, TraceSink};
pub use sr_kernel::{run_once, SimulationKernel};
pub use sr_orchestrator::{BatchProgress, CancelHandle, Orchestrator};
pub use sr_results::{AggregateResult, ExposureEvent, RunResult};
pub use sr_rng::SeedRng;
pub use sr_sampler::{DistributionKind, DistributionSpec};
pub use sr_scenario::{AuthMode, NetworkLatency, ScenarioSpec};
