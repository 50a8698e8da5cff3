//! Command surface for GUI, tray, and export consumers, organized by domain.
//!
//! - `history`: usage snapshots, live rate, CSV export
//! - `system`: alert thresholds, reset, backups, persistence status, power events
//! - `logic`: Pure business logic functions (unit-testable)
//! - `state`: `MeterHandle` and the messages it sends to the sampling task

mod history;
pub mod logic;
mod state;
mod system;

pub(crate) use state::MeterCommand;
pub use state::{MeterHandle, PersistenceStatus};
