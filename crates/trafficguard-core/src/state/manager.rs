//! Time-windowed traffic ledger

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{ProcessStats, TrafficEvent};

/// Concurrency-safe ledger of per-process traffic
///
/// Writers (`ingest`, `sweep`) take the lock exclusively, readers
/// (`snapshot`) share it. An entry lives while events keep arriving within
/// `time_window` and is removed by the first sweep after that.
pub struct StateManager {
    ledger: RwLock<HashMap<u32, ProcessStats>>,
    time_window: Duration,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("time_window", &self.time_window)
            .field("len", &self.len())
            .finish()
    }
}

impl StateManager {
    /// Create an empty ledger
    pub fn new(time_window: Duration) -> Self {
        Self {
            ledger: RwLock::new(HashMap::new()),
            time_window,
        }
    }

    /// Idle time after which an entry is swept
    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    /// Fold an event into the ledger, stamped with the current time
    pub fn ingest(&self, event: &TrafficEvent) {
        self.ingest_at(event, Utc::now());
    }

    /// Fold an event into the ledger as if it arrived at `now`
    pub fn ingest_at(&self, event: &TrafficEvent, now: DateTime<Utc>) {
        {
            let mut ledger = self.ledger.write();
            ledger
                .entry(event.pid)
                .or_insert_with(|| ProcessStats::new(event.pid, now))
                .record(event, now);
        }

        metrics::counter!("trafficguard_events_ingested_total").increment(1);
        metrics::counter!("trafficguard_bytes_ingested_total").increment(event.bytes);
    }

    /// Independent copy of every live entry, in no particular order
    pub fn snapshot(&self) -> Vec<ProcessStats> {
        self.ledger.read().values().cloned().collect()
    }

    /// Copy of a single entry
    pub fn get(&self, pid: u32) -> Option<ProcessStats> {
        self.ledger.read().get(&pid).cloned()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.ledger.read().len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry idle for longer than the window, returning how many went
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let window = self.time_window;

        let (removed, remaining) = {
            let mut ledger = self.ledger.write();
            let before = ledger.len();
            ledger.retain(|_, stats| !stats.is_idle(now, window));
            (before - ledger.len(), ledger.len())
        };

        if removed > 0 {
            debug!(count = removed, remaining, "Swept idle ledger entries");
            metrics::counter!("trafficguard_ledger_swept_total").increment(removed as u64);
        }
        metrics::gauge!("trafficguard_ledger_entries").set(remaining as f64);

        removed
    }

    /// Drain the event queue into the ledger until cancelled or the queue closes
    pub async fn consume(&self, mut events: mpsc::Receiver<TrafficEvent>, cancel: CancellationToken) {
        info!("Starting state manager");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = events.recv() => match event {
                    Some(event) => self.ingest(&event),
                    None => {
                        info!("Event queue closed");
                        break;
                    }
                },
            }
        }

        info!("State manager stopped");
    }

    /// Sweep once per window until cancelled
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let period = self.time_window;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period = %humantime::format_duration(period),
            "Starting ledger sweeper"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }

        info!("Ledger sweeper stopped");
    }
}
