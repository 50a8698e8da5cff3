//! Table layout and row mapping for the usage history database.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use super::PersistedState;
use crate::core::{
    AlertState, AlertThresholds, ByteCounts, DailyUsageRecord, UsageHistory, UNKNOWN_IDENTITY,
};

pub(super) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS daily_usage (
        date TEXT PRIMARY KEY,
        total_received INTEGER NOT NULL DEFAULT 0,
        total_sent INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS identity_usage (
        date TEXT NOT NULL,
        identity TEXT NOT NULL,
        received_bytes INTEGER NOT NULL DEFAULT 0,
        sent_bytes INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (date, identity)
    );
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS alert_state (
        date TEXT PRIMARY KEY,
        warning_fired INTEGER NOT NULL DEFAULT 0,
        critical_fired INTEGER NOT NULL DEFAULT 0,
        exceeded_fired INTEGER NOT NULL DEFAULT 0
    );
";

const DATE_FORMAT: &str = "%Y-%m-%d";

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).with_context(|| format!("invalid date '{raw}'"))
}

/// Insert every record, the thresholds, and the alert state.
pub(super) fn write_state(conn: &Connection, state: &PersistedState) -> rusqlite::Result<()> {
    let mut day_stmt = conn.prepare_cached(
        "INSERT INTO daily_usage (date, total_received, total_sent) VALUES (?1, ?2, ?3)",
    )?;
    let mut identity_stmt = conn.prepare_cached(
        "INSERT INTO identity_usage (date, identity, received_bytes, sent_bytes)
         VALUES (?1, ?2, ?3, ?4)",
    )?;

    for record in state.history.records() {
        let date = format_date(record.date);
        day_stmt.execute(params![
            date,
            record.total_received_bytes,
            record.total_sent_bytes,
        ])?;
        for (identity, counts) in &record.by_identity {
            identity_stmt.execute(params![
                date,
                identity,
                counts.received_bytes,
                counts.sent_bytes,
            ])?;
        }
    }

    if let Some(t) = &state.thresholds {
        let mut stmt = conn.prepare_cached("INSERT INTO settings (key, value) VALUES (?1, ?2)")?;
        stmt.execute(params!["warning_bytes", t.warning_bytes])?;
        stmt.execute(params!["critical_bytes", t.critical_bytes])?;
        stmt.execute(params!["limit_bytes", t.limit_bytes])?;
    }

    if let Some((date, alerts)) = &state.alert_state {
        conn.execute(
            "INSERT INTO alert_state (date, warning_fired, critical_fired, exceeded_fired)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                format_date(*date),
                alerts.warning_fired as i32,
                alerts.critical_fired as i32,
                alerts.exceeded_fired as i32
            ],
        )?;
    }
    Ok(())
}

/// Read the current layout, validating ordering and totals.
pub(super) fn read_current(conn: &Connection) -> Result<PersistedState> {
    let mut records: BTreeMap<NaiveDate, DailyUsageRecord> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT date, total_received, total_sent FROM daily_usage ORDER BY date ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, u64>(2)?,
        ))
    })?;
    for row in rows {
        let (raw_date, total_received_bytes, total_sent_bytes) = row?;
        let date = parse_date(&raw_date)?;
        records.insert(
            date,
            DailyUsageRecord {
                date,
                by_identity: BTreeMap::new(),
                total_received_bytes,
                total_sent_bytes,
            },
        );
    }

    let mut stmt = conn.prepare(
        "SELECT date, identity, received_bytes, sent_bytes FROM identity_usage",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u64>(2)?,
            row.get::<_, u64>(3)?,
        ))
    })?;
    for row in rows {
        let (raw_date, identity, received_bytes, sent_bytes) = row?;
        let date = parse_date(&raw_date)?;
        let record = records
            .get_mut(&date)
            .ok_or_else(|| anyhow!("identity row for {date} has no day row"))?;
        record.by_identity.insert(
            identity,
            ByteCounts {
                received_bytes,
                sent_bytes,
            },
        );
    }

    let history =
        UsageHistory::from_records(records.into_values().collect()).map_err(|e| anyhow!(e))?;

    Ok(PersistedState {
        history,
        thresholds: read_thresholds(conn)?,
        alert_state: read_alert_state(conn)?,
    })
}

fn read_thresholds(conn: &Connection) -> Result<Option<AlertThresholds>> {
    let get = |key: &str| -> rusqlite::Result<Option<u64>> {
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    };
    let (Some(warning_bytes), Some(critical_bytes), Some(limit_bytes)) = (
        get("warning_bytes")?,
        get("critical_bytes")?,
        get("limit_bytes")?,
    ) else {
        return Ok(None);
    };
    let thresholds = AlertThresholds {
        warning_bytes,
        critical_bytes,
        limit_bytes,
    };
    if let Err(e) = thresholds.validate() {
        tracing::warn!("Ignoring stored thresholds: {e}");
        return Ok(None);
    }
    Ok(Some(thresholds))
}

fn read_alert_state(conn: &Connection) -> Result<Option<(NaiveDate, AlertState)>> {
    let row = conn
        .query_row(
            "SELECT date, warning_fired, critical_fired, exceeded_fired
             FROM alert_state ORDER BY date DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i32>(1)? != 0,
                    row.get::<_, i32>(2)? != 0,
                    row.get::<_, i32>(3)? != 0,
                ))
            },
        )
        .optional()?;
    row.map(|(raw_date, warning_fired, critical_fired, exceeded_fired)| {
        // A higher level implies the lower ones fired.
        let critical_fired = critical_fired || exceeded_fired;
        Ok((
            parse_date(&raw_date)?,
            AlertState {
                warning_fired: warning_fired || critical_fired,
                critical_fired,
                exceeded_fired,
            },
        ))
    })
    .transpose()
}

/// Read the unversioned layout: combined bytes per day and per SSID.
///
/// Combined bytes are counted as received. Days present only in the per-day
/// table are attributed to the unknown identity. Non-numeric values read as 0.
pub(super) fn read_legacy(conn: &Connection) -> Result<PersistedState> {
    let mut records: BTreeMap<NaiveDate, DailyUsageRecord> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT date, ssid, MAX(0, COALESCE(CAST(bytes_used AS INTEGER), 0)) FROM wifi_usage",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (raw_date, ssid, bytes) = row?;
        let date = parse_date(&raw_date)?;
        let identity = ssid
            .filter(|s| !s.is_empty() && s != "Unknown Network")
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
        records
            .entry(date)
            .or_insert_with(|| DailyUsageRecord::new(date))
            .add(&identity, u64::try_from(bytes).unwrap_or(0), 0);
    }

    let mut stmt = conn.prepare(
        "SELECT date, MAX(0, COALESCE(CAST(bytes_used AS INTEGER), 0)) FROM daily_usage",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (raw_date, bytes) = row?;
        let date = parse_date(&raw_date)?;
        records.entry(date).or_insert_with(|| {
            let mut record = DailyUsageRecord::new(date);
            record.add(UNKNOWN_IDENTITY, u64::try_from(bytes).unwrap_or(0), 0);
            record
        });
    }

    let history =
        UsageHistory::from_records(records.into_values().collect()).map_err(|e| anyhow!(e))?;
    tracing::info!("Imported {} day(s) from legacy history layout", history.len());

    Ok(PersistedState {
        history,
        thresholds: None,
        alert_state: None,
    })
}
