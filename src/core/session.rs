//! Routes each usage sample to its (day, identity) bucket and detects day rollover.

use chrono::NaiveDate;

use super::aggregator::{DailyAggregator, UsageHistory};
use super::identity::UNKNOWN_IDENTITY;
use super::sampler::UsageSample;

/// What happened while attributing one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionOutcome {
    pub day: NaiveDate,
    pub identity: String,
    /// The day was not the open day before this sample (rollover or first sample).
    pub day_changed: bool,
    /// The previously open day, now frozen, when a rollover happened.
    pub finalized_day: Option<NaiveDate>,
    pub identity_changed: bool,
    /// The sample's local date was earlier than the open day; the open day was kept.
    pub clock_anomaly: bool,
    pub evicted: Vec<NaiveDate>,
}

/// Sequential consumer of usage samples.
///
/// A sample is attributed entirely to the local date of `sampled_at`, but never
/// to a day earlier than the one already open, so a clock stepping backwards
/// (manual change, DST) can neither reopen a frozen day nor skip closing one.
#[derive(Debug, Default)]
pub struct SessionAttributor {
    open_day: Option<NaiveDate>,
    current_identity: Option<String>,
    in_clock_anomaly: bool,
}

impl SessionAttributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from persisted history: its newest day is treated as open.
    pub fn resume_from(history: &UsageHistory) -> Self {
        Self {
            open_day: history.latest().map(|r| r.date),
            ..Self::default()
        }
    }

    pub fn open_day(&self) -> Option<NaiveDate> {
        self.open_day
    }

    pub fn attribute(
        &mut self,
        sample: &UsageSample,
        aggregator: &mut DailyAggregator,
    ) -> AttributionOutcome {
        let derived = sample.sampled_at.date_naive();
        let (day, clock_anomaly) = match self.open_day {
            Some(open) if derived < open => (open, true),
            _ => (derived, false),
        };

        if clock_anomaly && !self.in_clock_anomaly {
            tracing::warn!(
                "Clock moved behind the open day ({derived} < {day}), keeping {day} open"
            );
        }
        self.in_clock_anomaly = clock_anomaly;

        let day_changed = self.open_day != Some(day);
        let mut finalized_day = None;
        let mut evicted = Vec::new();
        if day_changed {
            finalized_day = self.open_day;
            if let Some(previous) = finalized_day {
                tracing::info!("Day rollover: {previous} finalized, {day} opened");
            }
            aggregator.open_day(day);
            evicted = aggregator.evict_old();
            self.open_day = Some(day);
        }

        let identity = sample
            .network_identity
            .clone()
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());

        let identity_changed = self.current_identity.as_deref() != Some(identity.as_str());
        if identity_changed {
            match &self.current_identity {
                Some(previous) => {
                    tracing::info!("Network identity changed: {previous} -> {identity}")
                }
                None => tracing::info!("Network identity: {identity}"),
            }
            self.current_identity = Some(identity.clone());
        }

        aggregator.record_delta(
            day,
            &identity,
            sample.delta_received_bytes,
            sample.delta_sent_bytes,
        );

        AttributionOutcome {
            day,
            identity,
            day_changed,
            finalized_day,
            identity_changed,
            clock_anomaly,
            evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sampler::SampleKind;
    use chrono::{DateTime, Local, TimeZone};

    fn ts(d: u32, h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, d, h, m, s).unwrap()
    }

    fn sample(at: DateTime<Local>, identity: Option<&str>, rx: u64, tx: u64) -> UsageSample {
        UsageSample {
            delta_received_bytes: rx,
            delta_sent_bytes: tx,
            interval_secs: 1.0,
            network_identity: identity.map(str::to_string),
            sampled_at: at,
            kind: SampleKind::Normal,
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn aggregator() -> DailyAggregator {
        DailyAggregator::new(UsageHistory::default(), 30, 5)
    }

    #[test]
    fn test_identity_split_keeps_day_total() {
        let mut agg = aggregator();
        let mut attr = SessionAttributor::new();
        attr.attribute(&sample(ts(14, 9, 0, 0), Some("HomeWifi"), 700, 70), &mut agg);
        let outcome = attr.attribute(&sample(ts(14, 9, 0, 1), None, 300, 30), &mut agg);
        assert!(outcome.identity_changed);
        assert_eq!(outcome.identity, UNKNOWN_IDENTITY);

        let record = agg.history().get(date(14)).unwrap().clone();
        assert_eq!(record.by_identity.len(), 2);
        assert_eq!(record.by_identity["HomeWifi"].received_bytes, 700);
        assert_eq!(record.by_identity[UNKNOWN_IDENTITY].received_bytes, 300);
        assert_eq!(record.total_received_bytes, 1000);
        assert_eq!(record.total_sent_bytes, 100);
        assert!(record.totals_consistent());
    }

    #[test]
    fn test_network_named_unknown_is_not_the_unknown_bucket() {
        let mut agg = aggregator();
        let mut attr = SessionAttributor::new();
        attr.attribute(&sample(ts(14, 9, 0, 0), Some("Unknown"), 500, 50), &mut agg);
        let outcome = attr.attribute(&sample(ts(14, 9, 0, 1), None, 200, 20), &mut agg);
        assert!(outcome.identity_changed);

        let record = agg.history().get(date(14)).unwrap().clone();
        assert_eq!(record.by_identity.len(), 2);
        assert_eq!(record.by_identity["Unknown"].received_bytes, 500);
        assert_eq!(record.by_identity[UNKNOWN_IDENTITY].received_bytes, 200);
    }

    #[test]
    fn test_reconnect_to_same_identity_is_not_a_change() {
        let mut agg = aggregator();
        let mut attr = SessionAttributor::new();
        attr.attribute(&sample(ts(14, 9, 0, 0), Some("HomeWifi"), 1, 1), &mut agg);
        let outcome = attr.attribute(&sample(ts(14, 9, 0, 1), Some("HomeWifi"), 1, 1), &mut agg);
        assert!(!outcome.identity_changed);
    }

    #[test]
    fn test_midnight_rollover_finalizes_previous_day() {
        let mut agg = aggregator();
        let mut attr = SessionAttributor::new();
        let first = attr.attribute(&sample(ts(14, 23, 59, 59), Some("HomeWifi"), 10, 1), &mut agg);
        assert!(first.day_changed);
        assert_eq!(first.finalized_day, None);

        let next = attr.attribute(&sample(ts(15, 0, 0, 0), Some("HomeWifi"), 20, 2), &mut agg);
        assert!(next.day_changed);
        assert_eq!(next.finalized_day, Some(date(14)));
        assert_eq!(agg.day_totals(date(14)).received_bytes, 10);
        assert_eq!(agg.day_totals(date(15)).received_bytes, 20);
    }

    #[test]
    fn test_backwards_clock_keeps_open_day() {
        let mut agg = aggregator();
        let mut attr = SessionAttributor::new();
        attr.attribute(&sample(ts(15, 0, 0, 5), Some("HomeWifi"), 10, 1), &mut agg);
        let outcome = attr.attribute(&sample(ts(14, 23, 59, 50), Some("HomeWifi"), 5, 1), &mut agg);
        assert!(outcome.clock_anomaly);
        assert!(!outcome.day_changed);
        assert_eq!(outcome.day, date(15));
        assert_eq!(agg.day_totals(date(15)).received_bytes, 15);
        assert!(agg.history().get(date(14)).is_none());
    }

    #[test]
    fn test_resume_from_history_rolls_over_on_new_day() {
        let mut seed = aggregator();
        seed.record_delta(date(13), "HomeWifi", 100, 10);
        let history = seed.snapshot();

        let mut agg = DailyAggregator::new(history.clone(), 30, 5);
        let mut attr = SessionAttributor::resume_from(&history);
        assert_eq!(attr.open_day(), Some(date(13)));

        let outcome = attr.attribute(&sample(ts(14, 8, 0, 0), Some("HomeWifi"), 1, 1), &mut agg);
        assert_eq!(outcome.finalized_day, Some(date(13)));
        assert_eq!(agg.day_totals(date(13)).received_bytes, 100);
    }

    #[test]
    fn test_resume_from_history_continues_same_day() {
        let mut seed = aggregator();
        seed.record_delta(date(14), "HomeWifi", 100, 10);
        let history = seed.snapshot();

        let mut agg = DailyAggregator::new(history.clone(), 30, 5);
        let mut attr = SessionAttributor::resume_from(&history);
        let outcome = attr.attribute(&sample(ts(14, 8, 0, 0), Some("HomeWifi"), 1, 1), &mut agg);
        assert!(!outcome.day_changed);
        assert_eq!(agg.day_totals(date(14)).received_bytes, 101);
    }
}
