//! Sleep/resume detection as an explicit event channel.
//!
//! Hosts that receive OS power callbacks push events through a cloned
//! [`PowerEventSender`]. Where no such callback exists, [`clock_watch_task`]
//! infers a sleep from wall-clock time running ahead of monotonic time. The
//! sampling task drains the channel before each tick, so power events never
//! race the accounting path.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerEvent {
    Suspended { at: DateTime<Local> },
    Resumed { gap: Duration },
}

/// Sending half of the power event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PowerEventSender {
    tx: mpsc::UnboundedSender<PowerEvent>,
    suspended_at: Arc<Mutex<Option<DateTime<Local>>>>,
}

impl PowerEventSender {
    /// Report that the host is about to sleep.
    pub fn suspended(&self) {
        let at = Local::now();
        if let Ok(mut guard) = self.suspended_at.lock() {
            *guard = Some(at);
        }
        self.send(PowerEvent::Suspended { at });
    }

    /// Report that the host woke up; the gap is measured from the last `suspended()`.
    pub fn resumed(&self) {
        let since = self.suspended_at.lock().ok().and_then(|mut guard| guard.take());
        let gap = since
            .and_then(|at| (Local::now() - at).to_std().ok())
            .unwrap_or_default();
        self.send(PowerEvent::Resumed { gap });
    }

    /// Push an event as-is. Returns false once the meter has stopped.
    pub fn send(&self, event: PowerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Receiving half, owned by the sampling task.
#[derive(Debug)]
pub struct PowerStateMonitor {
    rx: mpsc::UnboundedReceiver<PowerEvent>,
}

/// Create a connected sender/monitor pair.
pub fn channel() -> (PowerEventSender, PowerStateMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PowerEventSender {
            tx,
            suspended_at: Arc::new(Mutex::new(None)),
        },
        PowerStateMonitor { rx },
    )
}

impl PowerStateMonitor {
    /// Take every event queued since the last call, in arrival order. Never blocks.
    pub fn drain(&mut self) -> Vec<PowerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Detects wall-clock time advancing much faster than monotonic time, which
/// happens across a suspend on hosts whose monotonic clock stops while asleep.
#[derive(Debug)]
pub struct ClockJumpDetector {
    threshold: Duration,
    last_wall: DateTime<Local>,
    last_mono: Instant,
}

impl ClockJumpDetector {
    pub fn new(threshold: Duration, wall: DateTime<Local>, mono: Instant) -> Self {
        Self {
            threshold,
            last_wall: wall,
            last_mono: mono,
        }
    }

    /// Record an observation. Returns `(suspended_at, wall_gap)` when a sleep is inferred.
    pub fn observe(
        &mut self,
        wall: DateTime<Local>,
        mono: Instant,
    ) -> Option<(DateTime<Local>, Duration)> {
        let wall_elapsed = (wall - self.last_wall).to_std().unwrap_or_default();
        let mono_elapsed = mono.saturating_duration_since(self.last_mono);
        let previous_wall = self.last_wall;
        self.last_wall = wall;
        self.last_mono = mono;

        if wall_elapsed.saturating_sub(mono_elapsed) > self.threshold {
            Some((previous_wall, wall_elapsed))
        } else {
            None
        }
    }
}

/// Poll the clocks and emit a `Suspended`/`Resumed` pair for every inferred sleep.
pub async fn clock_watch_task(
    sender: PowerEventSender,
    poll: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut detector = ClockJumpDetector::new(threshold, Local::now(), Instant::now());
    let mut ticker = tokio::time::interval(poll);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some((at, gap)) = detector.observe(Local::now(), Instant::now()) {
                    tracing::info!("Clock jump of {}s detected, treating as sleep", gap.as_secs());
                    if !sender.send(PowerEvent::Suspended { at }) {
                        break;
                    }
                    if !sender.send(PowerEvent::Resumed { gap }) {
                        break;
                    }
                }
            }
        }
    }
}
