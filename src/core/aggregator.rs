//! Per-day, per-identity usage accounting with a bounded retention window.
//!
//! [`DailyAggregator`] is owned by the sampling task and is the only mutable
//! copy of the history. Observers receive [`UsageHistory`] clones through
//! [`DailyAggregator::snapshot`] and never see the live structure.

use std::collections::{BTreeMap, VecDeque};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use super::sampler::UsageSample;

/// Received/sent byte pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounts {
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

impl ByteCounts {
    fn add(&mut self, received: u64, sent: u64) {
        self.received_bytes = self.received_bytes.saturating_add(received);
        self.sent_bytes = self.sent_bytes.saturating_add(sent);
    }
}

/// All usage for one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageRecord {
    pub date: NaiveDate,
    pub by_identity: BTreeMap<String, ByteCounts>,
    pub total_received_bytes: u64,
    pub total_sent_bytes: u64,
}

impl DailyUsageRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            by_identity: BTreeMap::new(),
            total_received_bytes: 0,
            total_sent_bytes: 0,
        }
    }

    /// Add usage to an identity bucket and to the day totals.
    pub fn add(&mut self, identity: &str, received: u64, sent: u64) {
        match self.by_identity.get_mut(identity) {
            Some(bucket) => bucket.add(received, sent),
            None => {
                let mut bucket = ByteCounts::default();
                bucket.add(received, sent);
                self.by_identity.insert(identity.to_string(), bucket);
            }
        }
        self.total_received_bytes = self.total_received_bytes.saturating_add(received);
        self.total_sent_bytes = self.total_sent_bytes.saturating_add(sent);
    }

    /// Whether the day totals equal the sum of the identity buckets.
    pub fn totals_consistent(&self) -> bool {
        let (rx, tx) = self.by_identity.values().fold((0u64, 0u64), |(rx, tx), b| {
            (rx.saturating_add(b.received_bytes), tx.saturating_add(b.sent_bytes))
        });
        rx == self.total_received_bytes && tx == self.total_sent_bytes
    }

    pub fn totals(&self) -> ByteCounts {
        ByteCounts {
            received_bytes: self.total_received_bytes,
            sent_bytes: self.total_sent_bytes,
        }
    }
}

/// Daily records ordered strictly by date, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DailyUsageRecord>", into = "Vec<DailyUsageRecord>")]
pub struct UsageHistory {
    records: Vec<DailyUsageRecord>,
}

impl UsageHistory {
    /// Build a history, rejecting unordered dates or inconsistent totals.
    pub fn from_records(records: Vec<DailyUsageRecord>) -> Result<Self, String> {
        for pair in records.windows(2) {
            if pair[0].date >= pair[1].date {
                return Err(format!(
                    "dates not strictly increasing: {} then {}",
                    pair[0].date, pair[1].date
                ));
            }
        }
        if let Some(bad) = records.iter().find(|r| !r.totals_consistent()) {
            return Err(format!("totals of {} do not match identity sums", bad.date));
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[DailyUsageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&DailyUsageRecord> {
        self.records.last()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&DailyUsageRecord> {
        self.records
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Records with `from <= date <= to`.
    pub fn range(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &DailyUsageRecord> {
        self.records
            .iter()
            .filter(move |r| r.date >= from && r.date <= to)
    }
}

impl TryFrom<Vec<DailyUsageRecord>> for UsageHistory {
    type Error = String;

    fn try_from(records: Vec<DailyUsageRecord>) -> Result<Self, Self::Error> {
        Self::from_records(records)
    }
}

impl From<UsageHistory> for Vec<DailyUsageRecord> {
    fn from(history: UsageHistory) -> Self {
        history.records
    }
}

/// Live transfer speed in bytes/sec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub download_bps: f64,
    pub upload_bps: f64,
}

/// Fixed-size sliding window over the most recent samples.
#[derive(Debug)]
struct RateWindow {
    capacity: usize,
    samples: VecDeque<(u64, u64, f64)>,
}

impl RateWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn push(&mut self, received: u64, sent: u64, interval_secs: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((received, sent, interval_secs));
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    fn rate(&self) -> RateSnapshot {
        let (rx, tx, elapsed) = self
            .samples
            .iter()
            .fold((0u64, 0u64, 0.0f64), |(rx, tx, el), &(r, t, i)| {
                (rx.saturating_add(r), tx.saturating_add(t), el + i)
            });
        if elapsed > 0.0 {
            RateSnapshot {
                download_bps: rx as f64 / elapsed,
                upload_bps: tx as f64 / elapsed,
            }
        } else {
            RateSnapshot::default()
        }
    }
}

/// Owner of the rolling usage history.
#[derive(Debug)]
pub struct DailyAggregator {
    history: UsageHistory,
    retention_days: u32,
    rate: RateWindow,
}

impl DailyAggregator {
    pub fn new(history: UsageHistory, retention_days: u32, rate_window: usize) -> Self {
        let mut aggregator = Self {
            history,
            retention_days: retention_days.max(1),
            rate: RateWindow::new(rate_window),
        };
        aggregator.evict_old();
        aggregator
    }

    /// Create a zeroed record for `day` if none exists. Returns true when created.
    pub fn open_day(&mut self, day: NaiveDate) -> bool {
        let records = &mut self.history.records;
        match records.binary_search_by_key(&day, |r| r.date) {
            Ok(_) => false,
            Err(pos) => {
                records.insert(pos, DailyUsageRecord::new(day));
                true
            }
        }
    }

    /// Add one tick's usage. Opens the day if needed and returns the updated record.
    ///
    /// Not idempotent: each delta must be delivered exactly once.
    pub fn record_delta(
        &mut self,
        day: NaiveDate,
        identity: &str,
        delta_received: u64,
        delta_sent: u64,
    ) -> &DailyUsageRecord {
        let records = &mut self.history.records;
        let pos = match records.binary_search_by_key(&day, |r| r.date) {
            Ok(pos) => pos,
            Err(pos) => {
                records.insert(pos, DailyUsageRecord::new(day));
                pos
            }
        };
        let record = &mut records[pos];
        record.add(identity, delta_received, delta_sent);
        record
    }

    /// Drop records more than `retention_days` older than the newest. Returns evicted dates.
    pub fn evict_old(&mut self) -> Vec<NaiveDate> {
        let Some(newest) = self.history.latest().map(|r| r.date) else {
            return Vec::new();
        };
        let Some(cutoff) = newest.checked_sub_days(Days::new(u64::from(self.retention_days))) else {
            return Vec::new();
        };
        let keep_from = self.history.records.partition_point(|r| r.date <= cutoff);
        let evicted: Vec<NaiveDate> = self
            .history
            .records
            .drain(..keep_from)
            .map(|r| r.date)
            .collect();
        if !evicted.is_empty() {
            tracing::info!(
                "Evicted {} day(s) older than {} days: {:?}",
                evicted.len(),
                self.retention_days,
                evicted
            );
        }
        evicted
    }

    /// Zero the record for `day`, keeping the day open.
    pub fn reset_day(&mut self, day: NaiveDate) {
        let records = &mut self.history.records;
        if let Ok(pos) = records.binary_search_by_key(&day, |r| r.date) {
            records[pos] = DailyUsageRecord::new(day);
        }
        self.rate.clear();
    }

    /// Replace the whole history (restore from backup).
    pub fn replace_history(&mut self, history: UsageHistory) {
        self.history = history;
        self.rate.clear();
        self.evict_old();
    }

    pub fn day_totals(&self, day: NaiveDate) -> ByteCounts {
        self.history.get(day).map(DailyUsageRecord::totals).unwrap_or_default()
    }

    /// Immutable copy of the full history.
    pub fn snapshot(&self) -> UsageHistory {
        self.history.clone()
    }

    /// Feed a sample into the live rate window.
    pub fn observe_rate(&mut self, sample: &UsageSample) {
        self.rate.push(
            sample.delta_received_bytes,
            sample.delta_sent_bytes,
            sample.interval_secs,
        );
    }

    /// Bytes/sec over the last few samples.
    pub fn current_rate(&self) -> RateSnapshot {
        self.rate.rate()
    }

    pub fn history(&self) -> &UsageHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn aggregator(retention: u32) -> DailyAggregator {
        DailyAggregator::new(UsageHistory::default(), retention, 3)
    }

    #[test]
    fn test_record_delta_keeps_totals_consistent() {
        let mut agg = aggregator(30);
        agg.record_delta(day(1), "HomeWifi", 500, 100);
        agg.record_delta(day(1), "HomeWifi", 100, 50);
        let record = agg.record_delta(day(1), "Unknown", 40, 4);
        assert!(record.totals_consistent());
        assert_eq!(record.total_received_bytes, 640);
        assert_eq!(record.total_sent_bytes, 154);
        assert_eq!(record.by_identity["HomeWifi"].received_bytes, 600);
        assert_eq!(record.by_identity["Unknown"].sent_bytes, 4);
    }

    #[test]
    fn test_open_day_is_idempotent() {
        let mut agg = aggregator(30);
        assert!(agg.open_day(day(1)));
        agg.record_delta(day(1), "HomeWifi", 10, 10);
        assert!(!agg.open_day(day(1)));
        assert_eq!(agg.day_totals(day(1)).received_bytes, 10);
    }

    #[test]
    fn test_history_stays_ordered_when_opening_out_of_order() {
        let mut agg = aggregator(30);
        agg.open_day(day(5));
        agg.open_day(day(3));
        agg.open_day(day(4));
        let dates: Vec<_> = agg.snapshot().records().iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![day(3), day(4), day(5)]);
    }

    #[test]
    fn test_evict_keeps_retention_window() {
        let mut agg = aggregator(30);
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for i in 0..45u64 {
            let d = start.checked_add_days(Days::new(i)).unwrap();
            agg.open_day(d);
            agg.evict_old();
            assert!(agg.history().len() <= 30);
        }
        let history = agg.snapshot();
        assert_eq!(history.len(), 30);
        assert_eq!(
            history.latest().unwrap().date,
            start.checked_add_days(Days::new(44)).unwrap()
        );
        assert_eq!(
            history.records()[0].date,
            start.checked_add_days(Days::new(15)).unwrap()
        );
    }

    #[test]
    fn test_evict_with_custom_retention_and_gaps() {
        let mut agg = aggregator(7);
        agg.open_day(day(1));
        agg.open_day(day(2));
        agg.open_day(day(9));
        let evicted = agg.evict_old();
        assert_eq!(evicted, vec![day(1), day(2)]);
        assert_eq!(agg.history().len(), 1);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let mut agg = aggregator(30);
        agg.record_delta(day(1), "HomeWifi", 10, 10);
        let snap = agg.snapshot();
        agg.record_delta(day(1), "HomeWifi", 10, 10);
        assert_eq!(snap.get(day(1)).unwrap().total_received_bytes, 10);
        assert_eq!(agg.day_totals(day(1)).received_bytes, 20);
    }

    #[test]
    fn test_reset_day_zeroes_record() {
        let mut agg = aggregator(30);
        agg.record_delta(day(1), "HomeWifi", 10, 10);
        agg.record_delta(day(2), "HomeWifi", 10, 10);
        agg.reset_day(day(2));
        assert_eq!(agg.day_totals(day(2)), ByteCounts::default());
        assert_eq!(agg.day_totals(day(1)).received_bytes, 10);
        assert!(agg.history().get(day(2)).is_some());
    }

    #[test]
    fn test_rate_uses_recent_window_only() {
        let mut agg = aggregator(30);
        let mk = |rx: u64, tx: u64| UsageSample {
            delta_received_bytes: rx,
            delta_sent_bytes: tx,
            interval_secs: 1.0,
            network_identity: None,
            sampled_at: chrono::Local::now(),
            kind: crate::core::sampler::SampleKind::Normal,
        };
        agg.observe_rate(&mk(1_000_000, 0));
        for _ in 0..3 {
            agg.observe_rate(&mk(300, 30));
        }
        let rate = agg.current_rate();
        assert_eq!(rate.download_bps, 300.0);
        assert_eq!(rate.upload_bps, 30.0);
    }

    #[test]
    fn test_rate_is_zero_without_elapsed_time() {
        assert_eq!(aggregator(30).current_rate(), RateSnapshot::default());
    }

    #[test]
    fn test_from_records_rejects_bad_histories() {
        let mut inconsistent = DailyUsageRecord::new(day(2));
        inconsistent.add("HomeWifi", 10, 10);
        inconsistent.total_received_bytes = 99;
        assert!(UsageHistory::from_records(vec![inconsistent]).is_err());

        let unordered = vec![DailyUsageRecord::new(day(3)), DailyUsageRecord::new(day(2))];
        assert!(UsageHistory::from_records(unordered).is_err());

        let duplicate = vec![DailyUsageRecord::new(day(3)), DailyUsageRecord::new(day(3))];
        assert!(UsageHistory::from_records(duplicate).is_err());
    }

    #[test]
    fn test_range_is_inclusive() {
        let mut agg = aggregator(30);
        for d in 1..=5 {
            agg.open_day(day(d));
        }
        let snap = agg.snapshot();
        let dates: Vec<_> = snap.range(day(2), day(4)).map(|r| r.date).collect();
        assert_eq!(dates, vec![day(2), day(3), day(4)]);
    }
}
