//! Threshold rule evaluation with per-process cooldown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RulesConfig;
use crate::models::{elapsed, Alert};
use crate::state::StateManager;

/// Parameters of the traffic threshold rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSettings {
    /// Alert when a process's total strictly exceeds this
    pub threshold_bytes: u64,
    /// Cadence of `check_rules` in the run loop
    pub check_interval: Duration,
    /// Minimum time between two alerts for the same PID
    pub cooldown: Duration,
}

impl From<&RulesConfig> for RuleSettings {
    fn from(rules: &RulesConfig) -> Self {
        Self {
            threshold_bytes: rules.threshold_bytes(),
            check_interval: rules.check_interval,
            cooldown: rules.alert_cooldown,
        }
    }
}

/// Rule engine that turns ledger snapshots into rate-limited alerts
///
/// A PID absent from the cooldown map is quiet. Raising an alert puts it in
/// cooldown; the record is dropped on the first check after the cooldown has
/// elapsed, whether or not the PID is still in the ledger.
pub struct RuleEngine {
    state: Arc<StateManager>,
    settings: RuleSettings,
    alert_tx: mpsc::Sender<Alert>,
    /// pid -> time of the last alert
    recently_alerted: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl RuleEngine {
    /// Create a rule engine reading from `state` and emitting into `alert_tx`
    pub fn new(state: Arc<StateManager>, settings: RuleSettings, alert_tx: mpsc::Sender<Alert>) -> Self {
        Self {
            state,
            settings,
            alert_tx,
            recently_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Rule parameters in effect
    pub fn settings(&self) -> RuleSettings {
        self.settings
    }

    /// Check the ledger every `check_interval` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            threshold_bytes = self.settings.threshold_bytes,
            check_interval = %humantime::format_duration(self.settings.check_interval),
            cooldown = %humantime::format_duration(self.settings.cooldown),
            "Starting rule engine"
        );

        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.check_rules(Utc::now()).await;
                }
            }
        }

        info!("Rule engine stopped");
    }

    /// Evaluate the threshold rule against a fresh snapshot, returning the
    /// number of alerts emitted
    ///
    /// Emission waits for room on the alert queue, so a slow sink stalls the
    /// pass rather than losing alerts.
    pub async fn check_rules(&self, now: DateTime<Utc>) -> usize {
        self.prune_cooldowns(now);

        let snapshot = self.state.snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        debug!(process_count = snapshot.len(), "Checking rules");

        let threshold = self.settings.threshold_bytes;
        let mut emitted = 0;

        for stats in snapshot {
            if stats.total_bytes <= threshold {
                continue;
            }

            if self.is_cooling_down(stats.pid, now) {
                metrics::counter!("trafficguard_alerts_suppressed_total").increment(1);
                continue;
            }

            warn!(
                pid = stats.pid,
                process = stats.process_name.as_deref().unwrap_or("-"),
                traffic_bytes = stats.total_bytes,
                threshold_bytes = threshold,
                "Rule violated"
            );

            let pid = stats.pid;
            if self.alert_tx.send(Alert::new(stats, now)).await.is_err() {
                warn!(pid, "Alert queue closed, dropping remaining alerts for this pass");
                break;
            }

            self.mark_alerted(pid, now);
            metrics::counter!("trafficguard_alerts_raised_total").increment(1);
            emitted += 1;
        }

        emitted
    }

    /// Whether `pid` is still inside its cooldown at `now`
    ///
    /// An expired record is removed as a side effect.
    pub fn is_cooling_down(&self, pid: u32, now: DateTime<Utc>) -> bool {
        let mut alerted = self.recently_alerted.lock();

        let Some(last_alert) = alerted.get(&pid).copied() else {
            return false;
        };

        if elapsed(last_alert, now) > self.settings.cooldown {
            alerted.remove(&pid);
            return false;
        }

        true
    }

    /// Number of PIDs currently holding a cooldown record
    pub fn cooldown_count(&self) -> usize {
        self.recently_alerted.lock().len()
    }

    /// Drop every cooldown record that has expired at `now`, including those
    /// of PIDs no longer in the ledger
    fn prune_cooldowns(&self, now: DateTime<Utc>) {
        let cooldown = self.settings.cooldown;
        let mut alerted = self.recently_alerted.lock();
        let before = alerted.len();
        alerted.retain(|_, last_alert| elapsed(*last_alert, now) <= cooldown);

        let pruned = before - alerted.len();
        if pruned > 0 {
            debug!(pruned, remaining = alerted.len(), "Expired cooldown records dropped");
        }
    }

    fn mark_alerted(&self, pid: u32, now: DateTime<Utc>) {
        self.recently_alerted.lock().insert(pid, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrafficEvent;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const MB: u64 = 1024 * 1024;

    struct Harness {
        state: Arc<StateManager>,
        engine: RuleEngine,
        alerts: mpsc::Receiver<Alert>,
    }

    fn harness(threshold_bytes: u64, window: Duration, cooldown: Duration) -> Harness {
        let state = Arc::new(StateManager::new(window));
        let (tx, alerts) = mpsc::channel(16);
        let settings = RuleSettings {
            threshold_bytes,
            check_interval: Duration::from_secs(10),
            cooldown,
        };
        Harness {
            engine: RuleEngine::new(Arc::clone(&state), settings, tx),
            state,
            alerts,
        }
    }

    fn drain(alerts: &mut mpsc::Receiver<Alert>) -> Vec<Alert> {
        let mut out = Vec::new();
        while let Ok(alert) = alerts.try_recv() {
            out.push(alert);
        }
        out
    }

    #[tokio::test]
    async fn test_empty_ledger_is_noop() {
        let mut h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        assert_eq!(h.engine.check_rules(Utc::now()).await, 0);
        assert!(drain(&mut h.alerts).is_empty());
    }

    #[rstest]
    #[case::below(99, false)]
    #[case::exactly_at_threshold(100, false)]
    #[case::one_over(101, true)]
    #[tokio::test]
    async fn test_threshold_is_strict(#[case] bytes: u64, #[case] alerts: bool) {
        let mut h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        let now = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(1, bytes), now);

        let emitted = h.engine.check_rules(now).await;

        assert_eq!(emitted == 1, alerts);
        assert_eq!(drain(&mut h.alerts).len() == 1, alerts);
    }

    #[tokio::test]
    async fn test_alert_carries_snapshot_and_time() {
        let mut h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        let t0 = Utc::now();
        h.state
            .ingest_at(&TrafficEvent::new(8, 150).with_process_name("rsync"), t0);

        let check_time = t0 + ChronoDuration::seconds(10);
        h.engine.check_rules(check_time).await;

        let alerts = drain(&mut h.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].timestamp, check_time);
        assert_eq!(alerts[0].process_stats, h.state.get(8).unwrap());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_then_releases() {
        let cooldown = Duration::from_secs(900);
        let mut h = harness(100, Duration::from_secs(3600), cooldown);
        let t0 = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(5, 500), t0);

        assert_eq!(h.engine.check_rules(t0).await, 1);
        assert!(h.engine.is_cooling_down(5, t0 + ChronoDuration::seconds(1)));

        // inside the cooldown, including the exact boundary
        assert_eq!(h.engine.check_rules(t0 + ChronoDuration::seconds(60)).await, 0);
        assert_eq!(h.engine.check_rules(t0 + ChronoDuration::seconds(900)).await, 0);

        // just past it: exactly one new alert
        let later = t0 + ChronoDuration::seconds(901);
        assert_eq!(h.engine.check_rules(later).await, 1);

        let alerts = drain(&mut h.alerts);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].timestamp, later);
    }

    #[tokio::test]
    async fn test_expired_cooldown_record_is_removed_lazily() {
        let mut h = harness(100, Duration::from_secs(3600), Duration::from_secs(60));
        let t0 = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(5, 500), t0);
        h.engine.check_rules(t0).await;
        drain(&mut h.alerts);

        assert_eq!(h.engine.cooldown_count(), 1);
        assert!(!h.engine.is_cooling_down(5, t0 + ChronoDuration::seconds(61)));
        assert_eq!(h.engine.cooldown_count(), 0);
    }

    #[tokio::test]
    async fn test_cooldown_of_departed_pids_is_pruned() {
        let state = Arc::new(StateManager::new(Duration::from_secs(300)));
        let (tx, alerts) = mpsc::channel(512);
        let settings = RuleSettings {
            threshold_bytes: 100,
            check_interval: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
        };
        let mut h = Harness {
            engine: RuleEngine::new(Arc::clone(&state), settings, tx),
            state,
            alerts,
        };
        let t0 = Utc::now();
        for pid in 0..500 {
            h.state.ingest_at(&TrafficEvent::new(pid, 500), t0);
        }
        assert_eq!(h.engine.check_rules(t0).await, 500);
        assert_eq!(h.engine.cooldown_count(), 500);

        let next_day = t0 + ChronoDuration::days(1);
        assert_eq!(h.state.sweep(next_day), 500);

        // unrelated quiet traffic keeps the ledger non-empty
        h.state.ingest_at(&TrafficEvent::new(9_999, 1), next_day);
        assert_eq!(h.engine.check_rules(next_day).await, 0);
        assert_eq!(h.engine.cooldown_count(), 0);

        // an empty ledger still prunes
        h.state.ingest_at(&TrafficEvent::new(1, 500), next_day);
        h.engine.check_rules(next_day).await;
        assert_eq!(h.engine.cooldown_count(), 1);
        h.state.sweep(next_day + ChronoDuration::days(1));
        h.engine.check_rules(next_day + ChronoDuration::days(1)).await;
        assert_eq!(h.engine.cooldown_count(), 0);
        assert_eq!(drain(&mut h.alerts).len(), 501);
    }

    #[tokio::test]
    async fn test_zero_cooldown_realerts_on_next_check() {
        let mut h = harness(100, Duration::from_secs(300), Duration::ZERO);
        let t0 = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(5, 500), t0);

        assert_eq!(h.engine.check_rules(t0).await, 1);
        assert_eq!(h.engine.check_rules(t0).await, 0);
        assert_eq!(h.engine.check_rules(t0 + ChronoDuration::seconds(10)).await, 1);
        assert_eq!(drain(&mut h.alerts).len(), 2);
    }

    #[tokio::test]
    async fn test_pids_are_independent() {
        let mut h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        let t0 = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(1, 500), t0);
        h.engine.check_rules(t0).await;

        h.state.ingest_at(&TrafficEvent::new(2, 500), t0);
        let emitted = h.engine.check_rules(t0 + ChronoDuration::seconds(10)).await;

        assert_eq!(emitted, 1);
        let pids: Vec<u32> = drain(&mut h.alerts).iter().map(Alert::pid).collect();
        assert_eq!(pids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_closed_queue_does_not_arm_cooldown() {
        let h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        let t0 = Utc::now();
        h.state.ingest_at(&TrafficEvent::new(1, 500), t0);
        drop(h.alerts);

        assert_eq!(h.engine.check_rules(t0).await, 0);
        assert_eq!(h.engine.cooldown_count(), 0);
    }

    #[tokio::test]
    async fn test_traffic_scenario() {
        let mut h = harness(10 * MB, Duration::from_secs(300), Duration::from_secs(900));
        let t0 = Utc::now();
        let at = |secs: i64| t0 + ChronoDuration::seconds(secs);

        h.state.ingest_at(&TrafficEvent::new(42, 6 * MB), at(0));
        h.state.ingest_at(&TrafficEvent::new(42, 5 * MB), at(50));
        assert_eq!(h.state.get(42).unwrap().total_bytes, 11 * MB);

        assert_eq!(h.engine.check_rules(at(60)).await, 1);
        let first = drain(&mut h.alerts);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pid(), 42);
        assert_eq!(first[0].process_stats.total_bytes, 11 * MB);

        // two minutes later, still over threshold but cooling down
        h.state.ingest_at(&TrafficEvent::new(42, MB), at(170));
        assert_eq!(h.engine.check_rules(at(180)).await, 0);
        assert!(drain(&mut h.alerts).is_empty());

        // sixteen idle minutes: swept and cooled down
        let idle = at(170 + 16 * 60);
        assert_eq!(h.state.sweep(idle), 1);
        assert!(h.state.get(42).is_none());
        assert!(!h.engine.is_cooling_down(42, idle));

        h.state.ingest_at(&TrafficEvent::new(42, MB), idle);
        assert_eq!(h.state.get(42).unwrap().total_bytes, MB);
        assert_eq!(h.engine.check_rules(idle).await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_sink_drains() {
        let state = Arc::new(StateManager::new(Duration::from_secs(300)));
        let (tx, mut rx) = mpsc::channel(1);
        let settings = RuleSettings {
            threshold_bytes: 10,
            check_interval: Duration::from_secs(10),
            cooldown: Duration::from_secs(900),
        };
        let engine = Arc::new(RuleEngine::new(Arc::clone(&state), settings, tx));
        let now = Utc::now();
        for pid in 0..3 {
            state.ingest_at(&TrafficEvent::new(pid, 100), now);
        }

        let check = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.check_rules(now).await })
        };

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap().pid());
        }
        received.sort_unstable();

        assert_eq!(check.await.unwrap(), 3);
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_checks_on_interval_and_stops() {
        let mut h = harness(100, Duration::from_secs(300), Duration::from_secs(900));
        h.state.ingest(&TrafficEvent::new(3, 1_000));
        let engine = Arc::new(h.engine);
        let cancel = CancellationToken::new();

        let task = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.alerts.recv().await.unwrap().pid(), 3);

        cancel.cancel();
        task.await.unwrap();
    }
}
