//! SQLite persistence for the usage history.
//!
//! Uses `rusqlite` with bundled SQLite. Handles:
//! - Crash-safe saves: a complete database is written to a temporary file and
//!   atomically renamed over the primary, so the primary is always either the
//!   previous complete file or the new complete file
//! - Validated loads with fallback to the newest good backup, then to empty
//! - Versioned layouts (`PRAGMA user_version`), including the unversioned
//!   legacy layout
//! - Rotating backups (see [`backup`])

mod backup;
mod history;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags};

use crate::core::{AlertState, AlertThresholds, UsageHistory};
use crate::error::MeterError;

/// Current on-disk layout version.
pub const SCHEMA_VERSION: i64 = 2;

/// Layout written by the original monitor (combined bytes per day and SSID).
/// Those files were never stamped, so `user_version` 0 reads as this version.
pub const LEGACY_SCHEMA_VERSION: i64 = 1;

/// File name of the primary database inside the data directory.
pub const HISTORY_FILE_NAME: &str = "usage_history.db";

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub history: UsageHistory,
    pub thresholds: Option<AlertThresholds>,
    pub alert_state: Option<(NaiveDate, AlertState)>,
}

/// Where [`PersistenceStore::load`] found its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup(PathBuf),
    Empty,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub state: PersistedState,
    pub source: LoadSource,
}

/// Durable storage for [`PersistedState`].
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    path: PathBuf,
    backup_dir: PathBuf,
    backup_slots: usize,
}

impl PersistenceStore {
    /// Store rooted at `data_dir`: `usage_history.db` plus a `backups/` directory.
    pub fn new(data_dir: &Path, backup_slots: usize) -> Self {
        Self {
            path: data_dir.join(HISTORY_FILE_NAME),
            backup_dir: data_dir.join("backups"),
            backup_slots: backup_slots.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("db.tmp")
    }

    /// Durably replace the primary file with `state`.
    pub fn save(&self, state: &PersistedState) -> Result<(), MeterError> {
        self.write_snapshot(state).map_err(|e| {
            MeterError::PersistenceWriteFailed(format!("{}: {e:#}", self.path.display()))
        })?;
        tracing::debug!(
            "Saved {} day(s) of usage history to {}",
            state.history.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_snapshot(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        // Leftover from an interrupted save; it was never renamed so it holds nothing we need.
        let tmp = self.tmp_path();
        if tmp.exists() {
            fs::remove_file(&tmp).context("removing stale temporary file")?;
        }

        write_database(&tmp, state)?;

        fs::rename(&tmp, &self.path).context("renaming temporary file over primary")?;
        sync_parent_dir(&self.path);
        Ok(())
    }

    /// Load the primary file, else the newest valid backup, else an empty state.
    pub fn load(&self) -> LoadOutcome {
        if self.path.exists() {
            match Self::read_file(&self.path) {
                Ok(state) => {
                    tracing::info!(
                        "Loaded {} day(s) of usage history from {}",
                        state.history.len(),
                        self.path.display()
                    );
                    return LoadOutcome {
                        state,
                        source: LoadSource::Primary,
                    };
                }
                Err(e) => tracing::warn!("{e}. Trying backups."),
            }
        } else {
            tracing::info!("No usage history at {}", self.path.display());
        }

        match self.newest_valid_backup() {
            Some((path, state)) => {
                tracing::warn!("Recovered usage history from backup {}", path.display());
                LoadOutcome {
                    state,
                    source: LoadSource::Backup(path),
                }
            }
            None => {
                tracing::info!("Starting with empty usage history");
                LoadOutcome {
                    state: PersistedState::default(),
                    source: LoadSource::Empty,
                }
            }
        }
    }

    /// Read and validate one database file.
    pub fn read_file(path: &Path) -> Result<PersistedState, MeterError> {
        read_validated(path)
            .map_err(|e| MeterError::PersistenceCorrupt(format!("{}: {e:#}", path.display())))
    }
}

fn write_database(path: &Path, state: &PersistedState) -> Result<()> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("creating {}", path.display()))?;

    // Rollback journal, not WAL: after close the database is one self-contained
    // file that can be renamed and copied.
    conn.execute_batch("PRAGMA journal_mode=DELETE; PRAGMA synchronous=FULL;")?;
    conn.execute_batch(history::SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    let tx = conn.transaction()?;
    history::write_state(&tx, state)?;
    tx.commit()?;

    conn.close().map_err(|(_, e)| e).context("closing temporary database")?;
    Ok(())
}

fn read_validated(path: &Path) -> Result<PersistedState> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if integrity != "ok" {
        bail!("integrity check failed: {integrity}");
    }

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match version {
        0 | LEGACY_SCHEMA_VERSION => history::read_legacy(&conn),
        SCHEMA_VERSION => history::read_current(&conn),
        other => bail!("unsupported schema version {other} (newest known is {SCHEMA_VERSION})"),
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!("Directory sync failed for {}: {e}", parent.display());
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{DailyAggregator, UNKNOWN_IDENTITY};

    pub(crate) fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    pub(crate) fn make_state() -> PersistedState {
        let mut agg = DailyAggregator::new(UsageHistory::default(), 30, 5);
        agg.record_delta(date(12), "HomeWifi", 1_500, 300);
        agg.record_delta(date(13), "HomeWifi", 600, 150);
        agg.record_delta(date(13), UNKNOWN_IDENTITY, 40, 4);
        agg.record_delta(date(14), "Café Wi-Fi", 9_000_000_000, 12);
        PersistedState {
            history: agg.snapshot(),
            thresholds: Some(AlertThresholds {
                warning_bytes: 1_000_000,
                critical_bytes: 5_000_000,
                limit_bytes: 6_000_000,
            }),
            alert_state: Some((
                date(14),
                AlertState {
                    warning_fired: true,
                    critical_fired: false,
                    exceeded_fired: false,
                },
            )),
        }
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        let state = make_state();
        store.save(&state).unwrap();

        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Primary);
        assert_eq!(outcome.state, state);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_empty_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        store.save(&PersistedState::default()).unwrap();
        assert_eq!(store.load().state, PersistedState::default());
    }

    #[test]
    fn test_missing_everything_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Empty);
        assert!(outcome.state.history.is_empty());
    }

    #[test]
    fn test_interrupted_save_leaves_previous_history_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        let state = make_state();
        store.save(&state).unwrap();

        // A crash mid-write leaves a partial temp file that was never renamed.
        std::fs::write(store.tmp_path(), b"SQLite format 3\0partial garbage").unwrap();

        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Primary);
        assert_eq!(outcome.state, state);

        // The next save discards the stale temp file and succeeds.
        store.save(&PersistedState::default()).unwrap();
        assert!(store.load().state.history.is_empty());
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        let state = make_state();
        store.save(&state).unwrap();
        let backup = store.backup().unwrap();

        std::fs::write(store.path(), b"definitely not a database").unwrap();

        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Backup(backup));
        assert_eq!(outcome.state, state);
    }

    #[test]
    fn test_corrupt_primary_and_no_backup_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        std::fs::write(store.path(), b"definitely not a database").unwrap();
        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Empty);
    }

    #[test]
    fn test_read_file_reports_corruption_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, b"junk").unwrap();
        let err = PersistenceStore::read_file(&path).unwrap_err();
        assert_eq!(err.kind(), "PersistenceCorrupt");
    }

    #[test]
    fn test_newer_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        store.save(&make_state()).unwrap();
        {
            let conn = Connection::open(store.path()).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }
        let err = PersistenceStore::read_file(store.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }

    #[test]
    fn test_tampered_totals_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        store.save(&make_state()).unwrap();
        {
            let conn = Connection::open(store.path()).unwrap();
            conn.execute(
                "UPDATE daily_usage SET total_received = total_received + 1
                 WHERE date = '2024-05-13'",
                [],
            )
            .unwrap();
        }
        assert!(PersistenceStore::read_file(store.path()).is_err());
    }

    #[test]
    fn test_legacy_layout_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), 5);
        {
            let conn = Connection::open(store.path()).unwrap();
            conn.execute_batch(
                "
                CREATE TABLE daily_usage (date TEXT PRIMARY KEY, bytes_used INTEGER);
                CREATE TABLE wifi_usage (
                    date TEXT, ssid TEXT, bytes_used INTEGER, PRIMARY KEY (date, ssid)
                );
                INSERT INTO daily_usage VALUES ('2024-05-11', 900);
                INSERT INTO daily_usage VALUES ('2024-05-12', 'garbage');
                INSERT INTO wifi_usage VALUES ('2024-05-12', 'KZ_0099', 1200);
                INSERT INTO wifi_usage VALUES ('2024-05-12', 'Unknown Network', 300);
                INSERT INTO wifi_usage VALUES ('2024-05-12', 'Unknown', 5);
                INSERT INTO wifi_usage VALUES ('2024-05-13', 'KZ_0099', NULL);
                ",
            )
            .unwrap();
        }

        let outcome = store.load();
        assert_eq!(outcome.source, LoadSource::Primary);
        let history = outcome.state.history;
        assert_eq!(history.len(), 3);

        let day11 = history.get(date(11)).unwrap();
        assert_eq!(day11.by_identity[UNKNOWN_IDENTITY].received_bytes, 900);

        let day12 = history.get(date(12)).unwrap();
        assert_eq!(day12.total_received_bytes, 1505);
        assert_eq!(day12.total_sent_bytes, 0);
        assert_eq!(day12.by_identity["KZ_0099"].received_bytes, 1200);
        assert_eq!(day12.by_identity[UNKNOWN_IDENTITY].received_bytes, 300);
        // A network actually named "Unknown" keeps its own bucket.
        assert_eq!(day12.by_identity["Unknown"].received_bytes, 5);

        assert_eq!(history.get(date(13)).unwrap().total_received_bytes, 0);
        assert_eq!(outcome.state.thresholds, None);
    }

    #[test]
    fn test_save_into_unwritable_location_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = PersistenceStore::new(&blocker, 5);
        let err = store.save(&make_state()).unwrap_err();
        assert_eq!(err.kind(), "PersistenceWriteFailed");
    }
}
