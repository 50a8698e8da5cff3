//! Converts raw cumulative counter readings into per-tick usage deltas.

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use super::counters::RawCounterReading;
use super::power::PowerEvent;

/// Why a sample carries the deltas it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleKind {
    /// Ordinary delta against the previous reading.
    Normal,
    /// First reading; establishes the baseline.
    Baseline,
    /// A counter went backwards; rebased, zero contribution.
    CounterReset,
    /// First reading after a sleep; rebased, zero contribution.
    Resumed,
}

/// Usage observed during one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSample {
    pub delta_received_bytes: u64,
    pub delta_sent_bytes: u64,
    pub interval_secs: f64,
    pub network_identity: Option<String>,
    pub sampled_at: DateTime<Local>,
    pub kind: SampleKind,
}

impl UsageSample {
    fn zero(
        kind: SampleKind,
        network_identity: Option<String>,
        sampled_at: DateTime<Local>,
    ) -> Self {
        Self {
            delta_received_bytes: 0,
            delta_sent_bytes: 0,
            interval_secs: 0.0,
            network_identity,
            sampled_at,
            kind,
        }
    }
}

/// Per-tick delta computation with counter-reset and sleep handling.
///
/// The engine never emits negative usage and never attributes a sleep gap to
/// usage: in both cases the new reading becomes the baseline and the tick
/// contributes zero.
#[derive(Debug)]
pub struct SamplingEngine {
    sleep_gap: Duration,
    baseline: Option<RawCounterReading>,
    /// Wall time of the latest tick, including ticks whose counter read failed.
    last_tick_at: Option<DateTime<Local>>,
    suspended: bool,
    resume_pending: bool,
}

impl SamplingEngine {
    pub fn new(sleep_gap: Duration) -> Self {
        Self {
            sleep_gap,
            baseline: None,
            last_tick_at: None,
            suspended: false,
            resume_pending: false,
        }
    }

    /// Apply a power event drained before the tick.
    pub fn on_power_event(&mut self, event: &PowerEvent) {
        match event {
            PowerEvent::Suspended { at } => {
                tracing::info!("Suspend at {at}, sampling paused");
                self.suspended = true;
            }
            PowerEvent::Resumed { gap } => {
                tracing::info!("Resumed after {}s, baseline will be rebuilt", gap.as_secs());
                self.suspended = false;
                self.resume_pending = true;
            }
        }
    }

    /// True between a `Suspended` event and its `Resumed`.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Drop the baseline so the next reading starts fresh without emitting usage.
    pub fn rebase(&mut self) {
        self.baseline = None;
    }

    /// Record a tick whose counter read failed. The baseline is kept, so usage
    /// during the outage is counted by the next successful reading.
    pub fn note_skipped_tick(&mut self, at: DateTime<Local>) {
        if self.baseline.is_some() && !self.suspended {
            self.last_tick_at = Some(at);
        }
    }

    /// Feed one successful reading. Returns `None` only while suspended.
    pub fn ingest(
        &mut self,
        reading: RawCounterReading,
        network_identity: Option<String>,
    ) -> Option<UsageSample> {
        if self.suspended {
            return None;
        }

        let Some(previous) = self.baseline.replace(reading) else {
            self.resume_pending = false;
            self.last_tick_at = Some(reading.timestamp);
            return Some(UsageSample::zero(
                SampleKind::Baseline,
                network_identity,
                reading.timestamp,
            ));
        };

        let wall_gap = (reading.timestamp - previous.timestamp).to_std().ok();
        let last_tick = self
            .last_tick_at
            .replace(reading.timestamp)
            .unwrap_or(previous.timestamp);
        let tick_gap = (reading.timestamp - last_tick).to_std().ok();

        if std::mem::take(&mut self.resume_pending)
            || tick_gap.is_some_and(|gap| gap > self.sleep_gap)
        {
            tracing::debug!("Tick after sleep gap {tick_gap:?}, rebasing");
            return Some(UsageSample::zero(
                SampleKind::Resumed,
                network_identity,
                reading.timestamp,
            ));
        }

        if reading.received_bytes < previous.received_bytes
            || reading.sent_bytes < previous.sent_bytes
        {
            tracing::info!(
                "Counter reset detected (rx {} -> {}, tx {} -> {}), rebasing",
                previous.received_bytes,
                reading.received_bytes,
                previous.sent_bytes,
                reading.sent_bytes
            );
            return Some(UsageSample::zero(
                SampleKind::CounterReset,
                network_identity,
                reading.timestamp,
            ));
        }

        // A backwards wall clock still yields valid counter deltas; only the interval is unknown.
        Some(UsageSample {
            delta_received_bytes: reading.received_bytes - previous.received_bytes,
            delta_sent_bytes: reading.sent_bytes - previous.sent_bytes,
            interval_secs: wall_gap.map_or(0.0, |gap| gap.as_secs_f64()),
            network_identity,
            sampled_at: reading.timestamp,
            kind: SampleKind::Normal,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn at(secs: i64) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    pub(crate) fn reading(secs: i64, rx: u64, tx: u64) -> RawCounterReading {
        RawCounterReading {
            received_bytes: rx,
            sent_bytes: tx,
            timestamp: at(secs),
        }
    }

    fn engine() -> SamplingEngine {
        SamplingEngine::new(Duration::from_secs(30))
    }

    fn home() -> Option<String> {
        Some("HomeWifi".into())
    }

    #[test]
    fn test_first_reading_is_zero_baseline() {
        let mut e = engine();
        let s = e.ingest(reading(0, 1000, 500), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Baseline);
        assert_eq!((s.delta_received_bytes, s.delta_sent_bytes), (0, 0));
    }

    #[test]
    fn test_reset_scenario_totals() {
        let mut e = engine();
        let samples: Vec<UsageSample> = [
            reading(0, 1000, 500),
            reading(1, 1500, 600),
            reading(2, 1200, 650),
            reading(3, 1300, 700),
        ]
        .into_iter()
        .map(|r| e.ingest(r, home()).unwrap())
        .collect();

        let rx: u64 = samples.iter().map(|s| s.delta_received_bytes).sum();
        let tx: u64 = samples.iter().map(|s| s.delta_sent_bytes).sum();
        assert_eq!(rx, 600);
        assert_eq!(tx, 150);
        assert_eq!(samples[2].kind, SampleKind::CounterReset);
        assert_eq!(samples[3].kind, SampleKind::Normal);
    }

    #[test]
    fn test_monotonic_readings_sum_exactly() {
        let mut e = engine();
        let mut rx_total = 0u64;
        let mut tx_total = 0u64;
        let mut rx = 10_000u64;
        let mut tx = 3_000u64;
        e.ingest(reading(0, rx, tx), home());
        for i in 1..500i64 {
            rx += (i as u64 * 7919) % 1013;
            tx += (i as u64 * 104_729) % 97;
            let s = e.ingest(reading(i, rx, tx), home()).unwrap();
            rx_total += s.delta_received_bytes;
            tx_total += s.delta_sent_bytes;
        }
        assert_eq!(rx_total, rx - 10_000);
        assert_eq!(tx_total, tx - 3_000);
    }

    #[test]
    fn test_large_gap_is_treated_as_resume() {
        let mut e = engine();
        e.ingest(reading(0, 1000, 500), home());
        let s = e.ingest(reading(3600, 9_000_000, 8_000_000), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Resumed);
        assert_eq!(s.delta_received_bytes, 0);
        let s = e.ingest(reading(3601, 9_000_100, 8_000_010), home()).unwrap();
        assert_eq!((s.delta_received_bytes, s.delta_sent_bytes), (100, 10));
    }

    #[test]
    fn test_counter_outage_keeps_baseline_and_counts_usage() {
        let mut e = engine();
        e.ingest(reading(0, 1000, 500), home());
        for secs in 1..45 {
            e.note_skipped_tick(at(secs));
        }
        let s = e.ingest(reading(45, 46_000, 5_000), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Normal);
        assert_eq!((s.delta_received_bytes, s.delta_sent_bytes), (45_000, 4_500));
        assert_eq!(s.interval_secs, 45.0);
    }

    #[test]
    fn test_outage_followed_by_sleep_gap_still_rebases() {
        let mut e = engine();
        e.ingest(reading(0, 1000, 500), home());
        e.note_skipped_tick(at(1));
        let s = e.ingest(reading(600, 9_000, 900), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Resumed);
        assert_eq!(s.delta_received_bytes, 0);
    }

    #[test]
    fn test_suspend_skips_ticks_and_resume_rebases() {
        let mut e = engine();
        e.ingest(reading(0, 1000, 500), home());
        e.on_power_event(&PowerEvent::Suspended { at: at(1) });
        assert!(e.is_suspended());
        assert!(e.ingest(reading(2, 5000, 900), home()).is_none());

        e.on_power_event(&PowerEvent::Resumed {
            gap: Duration::from_secs(10),
        });
        let s = e.ingest(reading(12, 7000, 1200), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Resumed);
        assert_eq!(s.delta_received_bytes, 0);

        let s = e.ingest(reading(13, 7100, 1210), home()).unwrap();
        assert_eq!((s.delta_received_bytes, s.delta_sent_bytes), (100, 10));
    }

    #[test]
    fn test_backwards_clock_keeps_deltas_with_zero_interval() {
        let mut e = engine();
        e.ingest(reading(10, 1000, 500), home());
        let s = e.ingest(reading(5, 1200, 520), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Normal);
        assert_eq!(s.delta_received_bytes, 200);
        assert_eq!(s.interval_secs, 0.0);
    }

    #[test]
    fn test_rebase_starts_fresh() {
        let mut e = engine();
        e.ingest(reading(0, 1000, 500), home());
        e.rebase();
        let s = e.ingest(reading(1, 5000, 900), home()).unwrap();
        assert_eq!(s.kind, SampleKind::Baseline);
        assert_eq!(s.delta_received_bytes, 0);
    }

    #[test]
    fn test_identity_is_carried_through() {
        let mut e = engine();
        e.ingest(reading(0, 0, 0), None);
        let s = e.ingest(reading(1, 10, 10), None).unwrap();
        assert_eq!(s.network_identity, None);
        assert_eq!(s.interval_secs, 1.0);
    }
}
