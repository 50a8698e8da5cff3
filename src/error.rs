//! Unified error type for the metering core and its command surface.
//!
//! `MeterError` is returned by every fallible component boundary and by every
//! command on [`crate::commands::MeterHandle`]. It serializes as
//! `{ "kind": "...", "message": "..." }` so a GUI layer can distinguish error
//! categories without parsing messages.

use serde::ser::SerializeStruct;

/// Metering-level error.
///
/// Counter resets and clock anomalies are not errors. They are
/// ordinary outcomes of a tick, reported through `SampleKind::CounterReset`
/// and `AttributionOutcome::clock_anomaly`.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// The interface counter query failed or timed out. The tick is skipped.
    #[error("counter unavailable: {0}")]
    CounterUnavailable(String),

    /// A persisted file failed integrity, version, or invariant validation.
    #[error("persistence corrupt: {0}")]
    PersistenceCorrupt(String),

    /// Writing or backing up the persisted file failed (disk full, permissions).
    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    /// Filesystem errors outside the persistence file itself.
    #[error("{0}")]
    Io(String),

    /// Invalid or missing command input.
    #[error("{0}")]
    InvalidInput(String),

    /// The meter has stopped and can no longer accept commands.
    #[error("meter is shutting down")]
    ShuttingDown,
}

impl MeterError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            MeterError::CounterUnavailable(_) => "CounterUnavailable",
            MeterError::PersistenceCorrupt(_) => "PersistenceCorrupt",
            MeterError::PersistenceWriteFailed(_) => "PersistenceWriteFailed",
            MeterError::Io(_) => "Io",
            MeterError::InvalidInput(_) => "InvalidInput",
            MeterError::ShuttingDown => "ShuttingDown",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for MeterError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("MeterError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        MeterError::Io(err.to_string())
    }
}

impl From<csv::Error> for MeterError {
    fn from(err: csv::Error) -> Self {
        MeterError::Io(err.to_string())
    }
}
