//! Core logic: counter sampling, attribution, daily aggregation, alerts.
//!
//! - [`counters`]: `CounterSource` and the `sysinfo` implementation
//! - [`identity`]: wireless network identity resolution
//! - [`power`]: sleep/resume event channel and clock-jump watcher
//! - [`SamplingEngine`]: raw readings to non-negative per-tick deltas
//! - [`SessionAttributor`]: (day, identity) routing and day rollover
//! - [`DailyAggregator`]: retained per-day history and live rate
//! - [`AlertEngine`]: once-per-day warning/critical alerts

pub mod aggregator;
pub mod alerts;
pub mod counters;
pub mod identity;
pub mod power;
pub mod sampler;
pub mod session;

pub use aggregator::{ByteCounts, DailyAggregator, DailyUsageRecord, RateSnapshot, UsageHistory};
pub use alerts::{AlertEngine, AlertEvent, AlertLevel, AlertState, AlertThresholds};
pub use counters::{CounterSource, RawCounterReading, SysinfoCounterSource};
pub use identity::{NetworkIdentityResolver, SystemIdentityResolver, UNKNOWN_IDENTITY};
pub use power::{PowerEvent, PowerEventSender, PowerStateMonitor};
pub use sampler::{SampleKind, SamplingEngine, UsageSample};
pub use session::{AttributionOutcome, SessionAttributor};
