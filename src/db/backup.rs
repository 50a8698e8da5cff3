//! Timestamped backup copies of the primary database, rotated to a fixed count.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;

use super::{sync_parent_dir, PersistedState, PersistenceStore};
use crate::error::MeterError;

const BACKUP_PREFIX: &str = "usage_history_";
const BACKUP_SUFFIX: &str = ".db";

impl PersistenceStore {
    /// Copy the primary file into `backups/` and prune to the configured slot count.
    pub fn backup(&self) -> Result<PathBuf, MeterError> {
        let path = self.write_backup().map_err(|e| {
            MeterError::PersistenceWriteFailed(format!("backup of {}: {e:#}", self.path.display()))
        })?;
        tracing::info!("Created backup {}", path.display());
        self.rotate_backups();
        Ok(path)
    }

    fn write_backup(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("creating {}", self.backup_dir.display()))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let target = self
            .backup_dir
            .join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
        let tmp = target.with_extension("db.tmp");

        fs::copy(&self.path, &tmp)
            .with_context(|| format!("copying {}", self.path.display()))?;
        fs::File::open(&tmp)
            .and_then(|f| f.sync_all())
            .context("syncing backup copy")?;
        fs::rename(&tmp, &target).context("renaming backup copy")?;
        sync_parent_dir(&target);
        Ok(target)
    }

    /// Backup files, newest first. The timestamped names sort chronologically.
    pub fn list_backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.backup_dir) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(BACKUP_SUFFIX))
            })
            .collect();
        backups.sort();
        backups.reverse();
        backups
    }

    fn rotate_backups(&self) {
        for stale in self.list_backups().into_iter().skip(self.backup_slots) {
            match fs::remove_file(&stale) {
                Ok(()) => tracing::debug!("Removed old backup {}", stale.display()),
                Err(e) => tracing::warn!("Failed to remove old backup {}: {e}", stale.display()),
            }
        }
    }

    /// The newest backup that passes validation.
    pub(super) fn newest_valid_backup(&self) -> Option<(PathBuf, PersistedState)> {
        self.list_backups().into_iter().find_map(|path| match Self::read_file(&path) {
            Ok(state) => Some((path, state)),
            Err(e) => {
                tracing::warn!("Skipping unusable backup: {e}");
                None
            }
        })
    }

    /// Load the newest valid backup and make it the primary file.
    pub fn restore_latest_backup(&self) -> Result<(PathBuf, PersistedState), MeterError> {
        let (path, state) = self.newest_valid_backup().ok_or_else(|| {
            MeterError::PersistenceCorrupt(format!(
                "no valid backup in {}",
                self.backup_dir.display()
            ))
        })?;
        self.save(&state)?;
        tracing::info!("Restored usage history from {}", path.display());
        Ok((path, state))
    }
}
