//! Pure business logic behind the command surface.
//!
//! These functions take plain snapshots (no channels, no runtime) and can be
//! unit-tested directly.

use std::io;

use chrono::NaiveDate;
use serde::Serialize;

use crate::core::{DailyUsageRecord, UsageHistory};
use crate::error::MeterError;

/// One exported line: usage of one identity on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvRow<'a> {
    pub date: NaiveDate,
    pub identity: &'a str,
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

/// Reject ranges whose start is after their end.
pub fn validate_date_range(from: NaiveDate, to: NaiveDate) -> Result<(), MeterError> {
    if from > to {
        return Err(MeterError::InvalidInput(format!(
            "export range starts after it ends ({from} > {to})"
        )));
    }
    Ok(())
}

/// Rows for every (day, identity) with `from <= day <= to`, by date then identity.
pub fn csv_rows(history: &UsageHistory, from: NaiveDate, to: NaiveDate) -> Vec<CsvRow<'_>> {
    history
        .range(from, to)
        .flat_map(|record| {
            record.by_identity.iter().map(move |(identity, counts)| CsvRow {
                date: record.date,
                identity,
                received_bytes: counts.received_bytes,
                sent_bytes: counts.sent_bytes,
            })
        })
        .collect()
}

/// Write `rows` as CSV with a `date,identity,received_bytes,sent_bytes` header.
pub fn write_csv<W: io::Write>(writer: W, rows: &[CsvRow<'_>]) -> Result<(), MeterError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        csv_writer.write_record(["date", "identity", "received_bytes", "sent_bytes"])?;
    }
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Render the inclusive range as a CSV document.
pub fn render_csv(
    history: &UsageHistory,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<String, MeterError> {
    validate_date_range(from, to)?;
    let mut buf = Vec::new();
    write_csv(&mut buf, &csv_rows(history, from, to))?;
    String::from_utf8(buf).map_err(|e| MeterError::Io(format!("CSV output is not UTF-8: {e}")))
}

/// The record for `today`, or an empty one when nothing was recorded yet.
pub fn today_record(history: &UsageHistory, today: NaiveDate) -> DailyUsageRecord {
    history
        .get(today)
        .cloned()
        .unwrap_or_else(|| DailyUsageRecord::new(today))
}

/// Format a byte count the way the usage display shows it.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.2} MB", b / MB)
    } else {
        format!("{:.2} GB", b / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DailyAggregator;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn make_history() -> UsageHistory {
        let mut agg = DailyAggregator::new(UsageHistory::default(), 30, 5);
        agg.record_delta(date(12), "HomeWifi", 1_500, 300);
        agg.record_delta(date(13), "HomeWifi", 600, 150);
        agg.record_delta(date(13), "Unknown", 40, 4);
        agg.record_delta(date(14), "Office, 2nd floor", 7, 1);
        agg.snapshot()
    }

    #[test]
    fn test_csv_rows_filter_inclusive_range() {
        let history = make_history();
        let rows = csv_rows(&history, date(13), date(14));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, date(13));
        assert_eq!(rows[0].identity, "HomeWifi");
        assert_eq!(rows[1].identity, "Unknown");
        assert_eq!(rows[2].date, date(14));
    }

    #[test]
    fn test_render_csv_has_header_and_quotes_commas() {
        let history = make_history();
        let csv = render_csv(&history, date(13), date(14)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "date,identity,received_bytes,sent_bytes");
        assert_eq!(lines[1], "2024-05-13,HomeWifi,600,150");
        assert_eq!(lines[2], "2024-05-13,Unknown,40,4");
        assert_eq!(lines[3], "2024-05-14,\"Office, 2nd floor\",7,1");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_render_csv_empty_range_has_header_only() {
        let history = make_history();
        let csv = render_csv(&history, date(1), date(2)).unwrap();
        assert_eq!(csv.trim_end(), "date,identity,received_bytes,sent_bytes");
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = render_csv(&make_history(), date(14), date(13)).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        assert!(validate_date_range(date(13), date(13)).is_ok());
    }

    #[test]
    fn test_today_record_defaults_to_empty() {
        let history = make_history();
        assert_eq!(today_record(&history, date(13)).total_received_bytes, 640);
        let empty = today_record(&history, date(20));
        assert_eq!(empty.date, date(20));
        assert!(empty.by_identity.is_empty());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50 GB");
    }
}
