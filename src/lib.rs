pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod services;

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::commands::logic::format_bytes;
use crate::config::MeterConfig;
use crate::core::{AlertLevel, SysinfoCounterSource, SystemIdentityResolver};
use crate::db::PersistenceStore;
use crate::services::{BackgroundServices, Probes};

pub use commands::MeterHandle;
pub use error::MeterError;

/// Log to stderr and to a daily-rotated file under `<data dir>/logs`.
///
/// The returned guard must be held until exit so buffered lines are flushed.
fn setup_tracing(data_dir: &Path) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "netmeter.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "netmeter=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

/// Run the meter until Ctrl-C, then save and back up.
pub fn run() -> anyhow::Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in NetMeter: {info}");
        default_hook(info);
    }));

    let data_dir = config::resolve_data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let _log_guard = setup_tracing(&data_dir);

    let config = MeterConfig::load_or_default(&data_dir.join(config::CONFIG_FILE_NAME));
    tracing::info!("Data directory: {}", data_dir.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netmeter")
        .build()
        .context("building async runtime")?;

    runtime.block_on(async move {
        let counters = SysinfoCounterSource::new(config.interface.clone());
        tracing::info!("Interfaces: {:?}", counters.interface_names());
        let probes = Probes {
            counters: Box::new(counters),
            identity: Box::new(SystemIdentityResolver::new()),
        };
        let store = PersistenceStore::new(&data_dir, config.backup_slots);
        let services = BackgroundServices::start(config, store, probes).await;

        let handle = services.handle();
        let mut alerts = handle.subscribe_alerts();
        let notifier = tokio::spawn(async move {
            while let Ok(alert) = alerts.recv().await {
                let label = match alert.level {
                    AlertLevel::Warning => "Warning",
                    AlertLevel::Critical => "Critical",
                    AlertLevel::Exceeded => "Limit exceeded",
                };
                tracing::warn!(
                    "{label}: {} used today on {} (threshold {})",
                    format_bytes(alert.total_bytes),
                    alert.identity,
                    format_bytes(alert.threshold_bytes)
                );
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;

        let today = handle.today_usage();
        tracing::info!(
            "Today: \u{2193} {} \u{2191} {}",
            format_bytes(today.total_received_bytes),
            format_bytes(today.total_sent_bytes)
        );
        drop(handle);
        let result = services.shutdown().await;
        notifier.abort();
        result.map_err(anyhow::Error::from)
    })
}
