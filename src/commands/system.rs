//! Alert thresholds, reset, backup/restore, persistence status, and power events.

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::core::{AlertEvent, AlertThresholds, PowerEventSender};
use crate::error::MeterError;

use super::state::{MeterCommand, MeterHandle, PersistenceStatus};

impl MeterHandle {
    // ---- Alerts ----

    /// Replace the daily thresholds and limit. Alerts already fired today stay
    /// fired. The new values are kept across restarts and override the config.
    pub async fn set_alert_thresholds(
        &self,
        warning_bytes: u64,
        critical_bytes: u64,
        limit_bytes: u64,
    ) -> Result<(), MeterError> {
        let thresholds = AlertThresholds {
            warning_bytes,
            critical_bytes,
            limit_bytes,
        };
        thresholds.validate()?;
        self.request(|reply| MeterCommand::SetThresholds { thresholds, reply })
            .await?
    }

    pub async fn alert_thresholds(&self) -> Result<AlertThresholds, MeterError> {
        self.request(|reply| MeterCommand::GetThresholds { reply }).await
    }

    /// Receive every alert published from now on.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    // ---- Usage ----

    /// Zero today's usage and re-arm today's alerts.
    pub async fn reset_today(&self) -> Result<(), MeterError> {
        self.request(|reply| MeterCommand::ResetToday { reply }).await?
    }

    // ---- Persistence ----

    /// Save, then write a backup copy. Returns the backup's path.
    pub async fn request_backup(&self) -> Result<PathBuf, MeterError> {
        self.request(|reply| MeterCommand::Backup { reply: Some(reply) })
            .await?
    }

    /// Replace the history with the newest valid backup. Returns the backup used.
    pub async fn restore_from_backup(&self) -> Result<PathBuf, MeterError> {
        self.request(|reply| MeterCommand::RestoreBackup { reply })
            .await?
    }

    pub fn persistence_status(&self) -> PersistenceStatus {
        self.persistence.borrow().clone()
    }

    // ---- Power ----

    /// Sender for hosts that receive OS suspend/resume callbacks.
    pub fn power_events(&self) -> PowerEventSender {
        self.power.clone()
    }
}
