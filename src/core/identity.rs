//! Wireless network identity (SSID) resolution.
//!
//! Identity is compared by value only: reconnecting to the same SSID is the
//! same identity. `None` means disconnected, wired, or undetectable, and is
//! accounted to [`UNKNOWN_IDENTITY`] by the session attributor.

use std::process::Command;
use std::time::{Duration, Instant};

use crate::config;

/// Reserved identity for usage that cannot be attributed to a network.
///
/// Longer than the 32-byte 802.11 SSID limit, so no real network can share it.
pub const UNKNOWN_IDENTITY: &str = "Unknown network (no SSID available)";

/// Longest SSID an 802.11 network can advertise, in bytes.
pub const MAX_SSID_BYTES: usize = 32;

/// Reports the identity of the currently connected wireless network.
pub trait NetworkIdentityResolver: Send {
    fn current_identity(&mut self) -> Option<String>;
}

/// Resolver that asks the OS wireless tools, caching the answer briefly so it
/// can be called on every sampling tick.
pub struct SystemIdentityResolver {
    refresh: Duration,
    cached: Option<(Instant, Option<String>)>,
}

impl SystemIdentityResolver {
    pub fn new() -> Self {
        Self::with_refresh(Duration::from_secs(config::IDENTITY_REFRESH_SECS))
    }

    pub fn with_refresh(refresh: Duration) -> Self {
        Self {
            refresh,
            cached: None,
        }
    }
}

impl Default for SystemIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkIdentityResolver for SystemIdentityResolver {
    fn current_identity(&mut self) -> Option<String> {
        if let Some((at, identity)) = &self.cached {
            if at.elapsed() < self.refresh {
                return identity.clone();
            }
        }
        let identity = query_os_identity();
        if self.cached.as_ref().map(|(_, prev)| prev) != Some(&identity) {
            tracing::debug!("Network identity resolved: {identity:?}");
        }
        self.cached = Some((Instant::now(), identity.clone()));
        identity
    }
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "windows")]
fn query_os_identity() -> Option<String> {
    run_tool("netsh", &["wlan", "show", "interfaces"]).and_then(|out| parse_netsh_ssid(&out))
}

#[cfg(target_os = "linux")]
fn query_os_identity() -> Option<String> {
    run_tool("iwgetid", &["-r"])
        .and_then(|out| non_empty(out.trim()))
        .or_else(|| {
            run_tool("nmcli", &["-t", "-f", "active,ssid", "dev", "wifi"])
                .and_then(|out| parse_nmcli_ssid(&out))
        })
}

#[cfg(target_os = "macos")]
fn query_os_identity() -> Option<String> {
    run_tool(
        "/System/Library/PrivateFrameworks/Apple80211.framework/Versions/Current/Resources/airport",
        &["-I"],
    )
    .and_then(|out| parse_airport_ssid(&out))
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
fn query_os_identity() -> Option<String> {
    None
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Extract the SSID from `netsh wlan show interfaces`, skipping the BSSID line.
pub fn parse_netsh_ssid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "SSID" {
            non_empty(value.trim())
        } else {
            None
        }
    })
}

/// Extract the active SSID from `nmcli -t -f active,ssid dev wifi`.
pub fn parse_nmcli_ssid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let ssid = line.strip_prefix("yes:")?;
        non_empty(&ssid.replace("\\:", ":"))
    })
}

/// Extract the SSID from `airport -I`.
pub fn parse_airport_ssid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "SSID" {
            non_empty(value.trim())
        } else {
            None
        }
    })
}
