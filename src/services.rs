//! Background service lifecycle management.
//!
//! `BackgroundServices` owns every task spawned for the meter, starting them
//! in dependency order and providing a clean, durable shutdown.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::commands::{MeterCommand, MeterHandle, PersistenceStatus};
use crate::config::{self, MeterConfig};
use crate::core::power::{self, PowerEvent, PowerStateMonitor};
use crate::core::{
    AlertEngine, AlertEvent, AlertThresholds, CounterSource, DailyAggregator,
    NetworkIdentityResolver, RawCounterReading, RateSnapshot, SampleKind, SamplingEngine,
    SessionAttributor, UsageHistory, UsageSample,
};
use crate::db::{LoadOutcome, LoadSource, PersistedState, PersistenceStore};
use crate::error::MeterError;

/// Work for the persistence task. Requests are handled strictly in order.
#[derive(Debug)]
enum PersistRequest {
    Save {
        state: Arc<PersistedState>,
        reply: Option<oneshot::Sender<Result<(), MeterError>>>,
    },
    Backup {
        reply: Option<oneshot::Sender<Result<PathBuf, MeterError>>>,
    },
    Restore {
        reply: oneshot::Sender<Result<(PathBuf, PersistedState), MeterError>>,
    },
}

/// Platform probes, queried together off the async executor.
pub struct Probes {
    pub counters: Box<dyn CounterSource>,
    pub identity: Box<dyn NetworkIdentityResolver>,
}

/// Manages all background tasks of a running meter.
///
/// Tasks are started in dependency order:
/// 1. Persistence worker (serialized saves, backups, restores)
/// 2. Sampling task (sole writer of the accounting state)
/// 3. Backup timer (periodic backups through the command channel)
/// 4. Clock watcher (infers sleep from wall-clock jumps)
pub struct BackgroundServices {
    handle: MeterHandle,
    cancel: CancellationToken,
    sampling: JoinHandle<PersistedState>,
    persistence: JoinHandle<()>,
    persist_tx: mpsc::UnboundedSender<PersistRequest>,
    helpers: Vec<JoinHandle<()>>,
}

impl BackgroundServices {
    /// Load persisted state and start all services.
    pub async fn start(config: MeterConfig, store: PersistenceStore, probes: Probes) -> Self {
        let store = Arc::new(store);
        let loaded = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.load())
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("History load task failed: {e}");
                    LoadOutcome {
                        state: PersistedState::default(),
                        source: LoadSource::Empty,
                    }
                })
        };

        let cancel = CancellationToken::new();
        let (power_tx, power_rx) = power::channel();
        let (command_tx, command_rx) = mpsc::channel(config::COMMAND_CHANNEL_SIZE);
        let (alert_tx, _) = broadcast::channel(config::ALERT_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(PersistenceStatus::default());
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        // 1. Persistence worker: must run before anything can request a save.
        let persistence = tokio::spawn(persistence_task(Arc::clone(&store), persist_rx, status_tx));

        // 2. Sampling task.
        let task = SamplingTask::new(
            config.clone(),
            loaded.state,
            Arc::new(Mutex::new(probes)),
            power_rx,
            persist_tx.clone(),
            alert_tx.clone(),
            status_rx.clone(),
        );
        let handle = MeterHandle {
            commands: command_tx,
            history: task.history_tx.subscribe(),
            rate: task.rate_tx.subscribe(),
            persistence: status_rx,
            alerts: alert_tx,
            power: power_tx.clone(),
        };
        let sampling = tokio::spawn(task.run(command_rx, cancel.child_token()));

        // 3. Backup timer: goes through the sampling task so the backup holds fresh data.
        let backup_timer = tokio::spawn(backup_timer_task(
            handle.clone(),
            config.backup_interval(),
            cancel.child_token(),
        ));

        // 4. Clock watcher: feeds the same power event channel as OS callbacks.
        let clock_watch = tokio::spawn(power::clock_watch_task(
            power_tx,
            Duration::from_secs(config::CLOCK_WATCH_INTERVAL_SECS),
            config.sleep_gap(),
            cancel.child_token(),
        ));

        tracing::info!(
            "Meter started: sampling every {:.1}s, limit mode {:?}, thresholds {:?}",
            config.sampling_interval_secs,
            config.limit_mode,
            config.thresholds()
        );

        Self {
            handle,
            cancel,
            sampling,
            persistence,
            persist_tx,
            helpers: vec![backup_timer, clock_watch],
        }
    }

    pub fn handle(&self) -> MeterHandle {
        self.handle.clone()
    }

    /// Stop sampling, drain pending writes, then save and back up the final state.
    pub async fn shutdown(self) -> Result<(), MeterError> {
        tracing::info!("Shutting down meter");
        self.cancel.cancel();
        for helper in self.helpers {
            if let Err(e) = helper.await {
                tracing::warn!("Background task ended abnormally: {e}");
            }
        }

        let final_state = self
            .sampling
            .await
            .map_err(|e| MeterError::Io(format!("sampling task failed: {e}")))?;

        let (save_tx, save_rx) = oneshot::channel();
        let (backup_tx, backup_rx) = oneshot::channel();
        self.persist_tx
            .send(PersistRequest::Save {
                state: Arc::new(final_state),
                reply: Some(save_tx),
            })
            .map_err(|_| MeterError::ShuttingDown)?;
        self.persist_tx
            .send(PersistRequest::Backup {
                reply: Some(backup_tx),
            })
            .map_err(|_| MeterError::ShuttingDown)?;
        drop(self.persist_tx);

        let saved = save_rx.await.map_err(|_| MeterError::ShuttingDown)?;
        let backed_up = backup_rx.await.map_err(|_| MeterError::ShuttingDown)?;
        if let Err(e) = self.persistence.await {
            tracing::warn!("Persistence task ended abnormally: {e}");
        }

        saved?;
        backed_up?;
        tracing::info!("Meter stopped, final state saved");
        Ok(())
    }
}

/// Sole owner and writer of the accounting pipeline.
struct SamplingTask {
    config: MeterConfig,
    probes: Arc<Mutex<Probes>>,
    power: PowerStateMonitor,
    sampler: SamplingEngine,
    attributor: SessionAttributor,
    aggregator: DailyAggregator,
    alerts: AlertEngine,
    /// Thresholds set through a command; only these are persisted.
    threshold_override: Option<AlertThresholds>,
    persist_tx: mpsc::UnboundedSender<PersistRequest>,
    alert_tx: broadcast::Sender<AlertEvent>,
    history_tx: watch::Sender<Arc<UsageHistory>>,
    rate_tx: watch::Sender<RateSnapshot>,
    status_rx: watch::Receiver<PersistenceStatus>,
    dirty: bool,
    counter_failures: u32,
}

impl SamplingTask {
    fn new(
        config: MeterConfig,
        state: PersistedState,
        probes: Arc<Mutex<Probes>>,
        power: PowerStateMonitor,
        persist_tx: mpsc::UnboundedSender<PersistRequest>,
        alert_tx: broadcast::Sender<AlertEvent>,
        status_rx: watch::Receiver<PersistenceStatus>,
    ) -> Self {
        let aggregator = DailyAggregator::new(
            state.history,
            config.retention_days,
            config::RATE_WINDOW_SAMPLES,
        );
        let attributor = SessionAttributor::resume_from(aggregator.history());

        // Thresholds changed at runtime are persisted and win over the config file.
        let threshold_override = state.thresholds;
        let mut alerts =
            AlertEngine::new(threshold_override.unwrap_or_else(|| config.thresholds()));
        if let Some((day, alert_state)) = state.alert_state {
            alerts.restore(day, alert_state);
        }

        let (history_tx, _) = watch::channel(Arc::new(aggregator.snapshot()));
        let (rate_tx, _) = watch::channel(RateSnapshot::default());

        Self {
            sampler: SamplingEngine::new(config.sleep_gap()),
            config,
            probes,
            power,
            attributor,
            aggregator,
            alerts,
            threshold_override,
            persist_tx,
            alert_tx,
            history_tx,
            rate_tx,
            status_rx,
            dirty: false,
            counter_failures: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MeterCommand>,
        cancel: CancellationToken,
    ) -> PersistedState {
        let mut ticker = interval(self.config.sampling_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let save_every = self.config.save_interval();
        let mut save_timer = interval_at(Instant::now() + save_every, save_every);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = ticker.tick() => self.tick().await,
                _ = save_timer.tick() => {
                    let retry = self.status_rx.borrow().consecutive_failures > 0;
                    if self.dirty || retry {
                        self.request_save();
                    }
                }
            }
        }

        tracing::debug!("Sampling task stopped");
        self.persisted_state()
    }

    async fn tick(&mut self) {
        for event in self.power.drain() {
            self.sampler.on_power_event(&event);
            if matches!(event, PowerEvent::Suspended { .. }) {
                self.request_save();
            }
        }
        if self.sampler.is_suspended() {
            return;
        }

        match self.read_probes().await {
            Ok((reading, identity)) => {
                if self.counter_failures > 0 {
                    tracing::info!(
                        "Counters available again after {} skipped tick(s)",
                        self.counter_failures
                    );
                    self.counter_failures = 0;
                }
                if let Some(sample) = self.sampler.ingest(reading, identity) {
                    self.apply_sample(sample);
                }
            }
            Err(e) => {
                self.sampler.note_skipped_tick(Local::now());
                self.counter_failures += 1;
                if self.counter_failures == 1 {
                    tracing::warn!("{e}. Skipping tick.");
                } else {
                    tracing::debug!("{e}. Skipping tick ({} in a row).", self.counter_failures);
                }
            }
        }
    }

    /// Read counters and identity on a blocking thread, bounded by the counter timeout.
    async fn read_probes(&self) -> Result<(RawCounterReading, Option<String>), MeterError> {
        let timeout = self.config.counter_timeout();
        let probes = Arc::clone(&self.probes);
        let query = tokio::task::spawn_blocking(move || {
            let mut guard = match probes.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // A timed-out query is still running; do not queue behind it.
                Err(TryLockError::WouldBlock) => {
                    return Err(MeterError::CounterUnavailable(
                        "previous counter query still running".into(),
                    ))
                }
            };
            let reading = guard.counters.read()?;
            let identity = guard.identity.current_identity();
            Ok((reading, identity))
        });

        match tokio::time::timeout(timeout, query).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MeterError::CounterUnavailable(format!("counter query failed: {e}"))),
            Err(_) => Err(MeterError::CounterUnavailable(format!(
                "counter query exceeded {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Route one sample through attribution, alerts, and publication.
    fn apply_sample(&mut self, sample: UsageSample) {
        if sample.kind != SampleKind::Normal {
            tracing::debug!("{:?} sample at {}, contributing zero", sample.kind, sample.sampled_at);
        }

        let outcome = self.attributor.attribute(&sample, &mut self.aggregator);
        self.aggregator.observe_rate(&sample);

        let totals = self.aggregator.day_totals(outcome.day);
        let total = self
            .config
            .limit_mode
            .total_of(totals.received_bytes, totals.sent_bytes);
        if let Some(event) = self.alerts.evaluate(outcome.day, total, &outcome.identity) {
            tracing::warn!(
                "{:?} alert: {} bytes used on {} (threshold {})",
                event.level,
                event.total_bytes,
                event.day,
                event.threshold_bytes
            );
            let _ = self.alert_tx.send(event);
            self.dirty = true;
        }

        let changed = sample.delta_received_bytes > 0
            || sample.delta_sent_bytes > 0
            || outcome.day_changed;
        if changed {
            self.dirty = true;
            self.publish_history();
        }
        let rate = self.aggregator.current_rate();
        tracing::trace!(
            "\u{2193} {} \u{2191} {}",
            format_speed_compact(rate.download_bps),
            format_speed_compact(rate.upload_bps)
        );
        self.rate_tx.send_replace(rate);

        if outcome.finalized_day.is_some() {
            self.request_save();
        }
    }

    async fn handle_command(&mut self, command: MeterCommand) {
        match command {
            MeterCommand::SetThresholds { thresholds, reply } => {
                let result = thresholds.validate().map(|()| {
                    self.alerts.set_thresholds(thresholds);
                    self.threshold_override = Some(thresholds);
                    tracing::info!(
                        "Alert thresholds set: warning {} bytes, critical {} bytes, limit {} bytes",
                        thresholds.warning_bytes,
                        thresholds.critical_bytes,
                        thresholds.limit_bytes
                    );
                    self.request_save();
                });
                let _ = reply.send(result);
            }
            MeterCommand::GetThresholds { reply } => {
                let _ = reply.send(self.alerts.thresholds());
            }
            MeterCommand::ResetToday { reply } => {
                let day = self
                    .attributor
                    .open_day()
                    .unwrap_or_else(|| Local::now().date_naive());
                self.aggregator.reset_day(day);
                self.alerts.start_day(day);
                self.alerts.clear();
                tracing::info!("Usage for {day} reset");
                self.publish_history();
                self.rate_tx.send_replace(RateSnapshot::default());
                self.request_save();
                let _ = reply.send(Ok(()));
            }
            MeterCommand::Backup { reply } => {
                self.request_save();
                if self.persist_tx.send(PersistRequest::Backup { reply }).is_err() {
                    tracing::warn!("Backup requested after persistence stopped");
                }
            }
            MeterCommand::RestoreBackup { reply } => {
                let _ = reply.send(self.restore_backup().await);
            }
        }
    }

    async fn restore_backup(&mut self) -> Result<PathBuf, MeterError> {
        let (tx, rx) = oneshot::channel();
        self.persist_tx
            .send(PersistRequest::Restore { reply: tx })
            .map_err(|_| MeterError::ShuttingDown)?;
        let (path, state) = rx.await.map_err(|_| MeterError::ShuttingDown)??;

        self.aggregator.replace_history(state.history);
        self.attributor = SessionAttributor::resume_from(self.aggregator.history());
        self.threshold_override = state.thresholds;
        let mut alerts = AlertEngine::new(
            state
                .thresholds
                .unwrap_or_else(|| self.config.thresholds()),
        );
        if let Some((day, alert_state)) = state.alert_state {
            alerts.restore(day, alert_state);
        }
        self.alerts = alerts;
        self.dirty = false;
        self.publish_history();
        self.rate_tx.send_replace(RateSnapshot::default());
        Ok(path)
    }

    fn publish_history(&self) {
        self.history_tx.send_replace(Arc::new(self.aggregator.snapshot()));
    }

    fn persisted_state(&self) -> PersistedState {
        PersistedState {
            history: self.aggregator.snapshot(),
            thresholds: self.threshold_override,
            alert_state: self.alerts.current(),
        }
    }

    fn request_save(&mut self) {
        let request = PersistRequest::Save {
            state: Arc::new(self.persisted_state()),
            reply: None,
        };
        if self.persist_tx.send(request).is_ok() {
            self.dirty = false;
        } else {
            tracing::warn!("Save requested after persistence stopped");
        }
    }
}

/// Serializes all disk I/O. Exits once every sender is dropped and the queue is empty.
async fn persistence_task(
    store: Arc<PersistenceStore>,
    mut requests: mpsc::UnboundedReceiver<PersistRequest>,
    status: watch::Sender<PersistenceStatus>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            PersistRequest::Save { state, reply } => {
                let result = run_blocking(&store, move |store| store.save(&state)).await;
                record_outcome(&status, "Save", result.as_ref().map(|_| ()));
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PersistRequest::Backup { reply } => {
                let result = run_blocking(&store, PersistenceStore::backup).await;
                record_outcome(&status, "Backup", result.as_ref().map(|_| ()));
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PersistRequest::Restore { reply } => {
                let result = run_blocking(&store, PersistenceStore::restore_latest_backup).await;
                if let Err(e) = &result {
                    tracing::warn!("Restore failed: {e}");
                }
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!("Persistence task stopped");
}

async fn run_blocking<T, F>(store: &Arc<PersistenceStore>, op: F) -> Result<T, MeterError>
where
    T: Send + 'static,
    F: FnOnce(&PersistenceStore) -> Result<T, MeterError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .unwrap_or_else(|e| {
            Err(MeterError::PersistenceWriteFailed(format!(
                "persistence worker failed: {e}"
            )))
        })
}

/// Track consecutive failures and flip the degraded flag.
fn record_outcome(
    status: &watch::Sender<PersistenceStatus>,
    operation: &str,
    result: Result<(), &MeterError>,
) {
    status.send_modify(|s| match result {
        Ok(()) => {
            let now = Some(Local::now());
            if operation == "Backup" {
                s.last_backup_at = now;
            } else {
                s.last_saved_at = now;
            }
            if s.degraded {
                tracing::info!("Persistence recovered");
            }
            s.consecutive_failures = 0;
            s.degraded = false;
            s.last_error = None;
        }
        Err(e) => {
            s.consecutive_failures += 1;
            s.last_error = Some(e.to_string());
            tracing::warn!("{operation} failed ({} in a row): {e}", s.consecutive_failures);
            if s.consecutive_failures >= config::PERSISTENCE_DEGRADED_AFTER && !s.degraded {
                tracing::error!("Persistence degraded: usage is not being saved");
                s.degraded = true;
            }
        }
    });
}

async fn backup_timer_task(handle: MeterHandle, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = handle.request_backup().await {
                    tracing::warn!("Scheduled backup failed: {e}");
                }
            }
        }
    }
}

/// Format a speed value in a compact human-readable form.
pub fn format_speed_compact(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{:.0} B/s", bps)
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.2} MB/s", bps / (1024.0 * 1024.0))
    }
}
