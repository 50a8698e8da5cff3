//! Usage snapshots, live rate, and CSV export.

use std::path::Path;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tokio::sync::watch;

use crate::core::{DailyUsageRecord, RateSnapshot, UsageHistory};
use crate::error::MeterError;

use super::logic::{csv_rows, render_csv, today_record, validate_date_range, write_csv};
use super::state::MeterHandle;

impl MeterHandle {
    /// The latest published history. Never reflects a partially applied tick.
    pub fn usage_history(&self) -> Arc<UsageHistory> {
        self.history.borrow().clone()
    }

    /// Receiver that is notified whenever a new history snapshot is published.
    pub fn subscribe_history(&self) -> watch::Receiver<Arc<UsageHistory>> {
        self.history.clone()
    }

    /// Download/upload speed over the last few samples.
    pub fn current_rate(&self) -> RateSnapshot {
        *self.rate.borrow()
    }

    /// Usage for the current local date, zero when nothing has been recorded yet.
    pub fn today_usage(&self) -> DailyUsageRecord {
        today_record(&self.usage_history(), Local::now().date_naive())
    }

    /// CSV of every (day, identity) in the inclusive range.
    pub fn export_csv(&self, from: NaiveDate, to: NaiveDate) -> Result<String, MeterError> {
        render_csv(&self.usage_history(), from, to)
    }

    /// Write the CSV export to `path`. Returns the number of data rows.
    pub fn export_csv_file(
        &self,
        path: &Path,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize, MeterError> {
        validate_date_range(from, to)?;
        let history = self.usage_history();
        let rows = csv_rows(&history, from, to);
        let file = std::fs::File::create(path)?;
        write_csv(file, &rows)?;
        tracing::info!("Exported {} row(s) to {}", rows.len(), path.display());
        Ok(rows.len())
    }
}
