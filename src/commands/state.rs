//! Shared handle to the running meter, and the messages it sends to the sampling task.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::core::{AlertEvent, AlertThresholds, PowerEventSender, RateSnapshot, UsageHistory};
use crate::error::MeterError;

/// Health of the persistence layer, published after every save or backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStatus {
    pub last_saved_at: Option<DateTime<Local>>,
    pub last_backup_at: Option<DateTime<Local>>,
    pub consecutive_failures: u32,
    /// Set after repeated consecutive failures; cleared by the next success.
    pub degraded: bool,
    pub last_error: Option<String>,
}

/// Mutations and queries served by the sampling task, each with a reply channel.
#[derive(Debug)]
pub(crate) enum MeterCommand {
    SetThresholds {
        thresholds: AlertThresholds,
        reply: oneshot::Sender<Result<(), MeterError>>,
    },
    GetThresholds {
        reply: oneshot::Sender<AlertThresholds>,
    },
    ResetToday {
        reply: oneshot::Sender<Result<(), MeterError>>,
    },
    /// Save the current state, then copy it into the backup directory.
    Backup {
        reply: Option<oneshot::Sender<Result<PathBuf, MeterError>>>,
    },
    RestoreBackup {
        reply: oneshot::Sender<Result<PathBuf, MeterError>>,
    },
}

/// Cloneable handle for GUI, tray, and export consumers.
///
/// Reads come from the latest published snapshot and never block the
/// sampling task. Mutations are queued to it and answered in order.
#[derive(Debug, Clone)]
pub struct MeterHandle {
    pub(crate) commands: mpsc::Sender<MeterCommand>,
    pub(crate) history: watch::Receiver<Arc<UsageHistory>>,
    pub(crate) rate: watch::Receiver<RateSnapshot>,
    pub(crate) persistence: watch::Receiver<PersistenceStatus>,
    pub(crate) alerts: broadcast::Sender<AlertEvent>,
    pub(crate) power: PowerEventSender,
}

impl MeterHandle {
    /// Send a command and wait for its reply.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MeterCommand,
    ) -> Result<T, MeterError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MeterError::ShuttingDown)?;
        rx.await.map_err(|_| MeterError::ShuttingDown)
    }
}
