//! Cumulative interface byte counters.

use chrono::{DateTime, Local};
use serde::Serialize;
use sysinfo::Networks;

use crate::config::InterfaceSelection;
use crate::error::MeterError;

/// One read of the cumulative received/sent counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawCounterReading {
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub timestamp: DateTime<Local>,
}

/// Source of cumulative byte counters for the monitored interface(s).
pub trait CounterSource: Send {
    fn read(&mut self) -> Result<RawCounterReading, MeterError>;
}

/// Counter source backed by `sysinfo`'s per-interface totals.
pub struct SysinfoCounterSource {
    networks: Networks,
    selection: InterfaceSelection,
    warned_missing: bool,
}

impl SysinfoCounterSource {
    pub fn new(selection: InterfaceSelection) -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            selection,
            warned_missing: false,
        }
    }

    /// Names of the interfaces currently known to the OS.
    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.iter().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }
}

impl CounterSource for SysinfoCounterSource {
    fn read(&mut self) -> Result<RawCounterReading, MeterError> {
        // Re-enumerate so interfaces that appear or vanish are reflected. A vanished
        // interface makes the summed counters drop, which the sampler treats as a reset.
        self.networks.refresh_list();
        self.networks.refresh();

        let totals: Vec<(&String, u64, u64)> = self
            .networks
            .iter()
            .map(|(name, data)| (name, data.total_received(), data.total_transmitted()))
            .collect();

        if totals.is_empty() {
            return Err(MeterError::CounterUnavailable(
                "no network interfaces reported".into(),
            ));
        }

        let (received_bytes, sent_bytes) = match &self.selection {
            InterfaceSelection::Named(wanted) => {
                match totals.iter().find(|(name, _, _)| *name == wanted) {
                    Some(&(_, rx, tx)) => {
                        self.warned_missing = false;
                        (rx, tx)
                    }
                    None => {
                        if !self.warned_missing {
                            tracing::warn!(
                                "Interface '{wanted}' not found, summing all interfaces"
                            );
                            self.warned_missing = true;
                        }
                        sum_totals(&totals)
                    }
                }
            }
            InterfaceSelection::Total => sum_totals(&totals),
        };

        Ok(RawCounterReading {
            received_bytes,
            sent_bytes,
            timestamp: Local::now(),
        })
    }
}

fn sum_totals(totals: &[(&String, u64, u64)]) -> (u64, u64) {
    totals.iter().fold((0u64, 0u64), |(rx, tx), &(_, r, t)| {
        (rx.saturating_add(r), tx.saturating_add(t))
    })
}
