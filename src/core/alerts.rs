//! Daily threshold alerts: `Clear -> WarningFired -> CriticalFired -> ExceededFired`,
//! each at most once per day.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::MeterError;

/// Daily byte thresholds; `warning_bytes < critical_bytes <= limit_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning_bytes: u64,
    pub critical_bytes: u64,
    /// The daily allowance; crossing it raises the `Exceeded` alert.
    pub limit_bytes: u64,
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<(), MeterError> {
        if self.warning_bytes == 0 {
            return Err(MeterError::InvalidInput(
                "warning threshold must be greater than zero".into(),
            ));
        }
        if self.warning_bytes >= self.critical_bytes {
            return Err(MeterError::InvalidInput(format!(
                "warning threshold ({}) must be below critical threshold ({})",
                self.warning_bytes, self.critical_bytes
            )));
        }
        if self.critical_bytes > self.limit_bytes {
            return Err(MeterError::InvalidInput(format!(
                "critical threshold ({}) must not exceed the daily limit ({})",
                self.critical_bytes, self.limit_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Warning,
    Critical,
    Exceeded,
}

/// Which thresholds have already fired for the open day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub warning_fired: bool,
    pub critical_fired: bool,
    pub exceeded_fired: bool,
}

/// A threshold crossing, published to notification consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub day: NaiveDate,
    pub total_bytes: u64,
    pub threshold_bytes: u64,
    pub identity: String,
}

/// Per-day alert state machine. Never reverts within a day.
#[derive(Debug)]
pub struct AlertEngine {
    thresholds: AlertThresholds,
    day: Option<NaiveDate>,
    state: AlertState,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            day: None,
            state: AlertState::default(),
        }
    }

    /// Restore the state persisted for `day` so a restart does not repeat alerts.
    pub fn restore(&mut self, day: NaiveDate, state: AlertState) {
        self.day = Some(day);
        self.state = state;
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    /// Replace thresholds. Flags already fired today stay fired.
    pub fn set_thresholds(&mut self, thresholds: AlertThresholds) {
        self.thresholds = thresholds;
    }

    /// The open day and its state, for persistence.
    pub fn current(&self) -> Option<(NaiveDate, AlertState)> {
        self.day.map(|day| (day, self.state))
    }

    /// Reset to `Clear` when `day` differs from the tracked day.
    pub fn start_day(&mut self, day: NaiveDate) {
        if self.day != Some(day) {
            self.day = Some(day);
            self.state = AlertState::default();
        }
    }

    /// Reset the open day's state to `Clear` (usage was zeroed).
    pub fn clear(&mut self) {
        self.state = AlertState::default();
    }

    /// Evaluate the updated total for `day`. Emits at most one event per call,
    /// for the highest level newly crossed; lower levels are marked as fired.
    pub fn evaluate(
        &mut self,
        day: NaiveDate,
        total_bytes: u64,
        identity: &str,
    ) -> Option<AlertEvent> {
        self.start_day(day);

        let event = |level, threshold_bytes| AlertEvent {
            level,
            day,
            total_bytes,
            threshold_bytes,
            identity: identity.to_string(),
        };
        let t = self.thresholds;

        if total_bytes >= t.limit_bytes && !self.state.exceeded_fired {
            self.state = AlertState {
                warning_fired: true,
                critical_fired: true,
                exceeded_fired: true,
            };
            Some(event(AlertLevel::Exceeded, t.limit_bytes))
        } else if total_bytes >= t.critical_bytes && !self.state.critical_fired {
            self.state.critical_fired = true;
            self.state.warning_fired = true;
            Some(event(AlertLevel::Critical, t.critical_bytes))
        } else if total_bytes >= t.warning_bytes && !self.state.warning_fired {
            self.state.warning_fired = true;
            Some(event(AlertLevel::Warning, t.warning_bytes))
        } else {
            None
        }
    }
}
