//! Fan-out of alerts to every registered sink

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AlerterConfig;
use crate::error::{Error, Result};
use crate::models::Alert;

use super::notifier::{AlertSink, LogSink, NotificationResult, TelegramSink, WebhookSink};

/// Delivers each alert to every registered sink
///
/// Failures are logged and reported back; nothing is retried.
#[derive(Default)]
pub struct AlertDispatcher {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl AlertDispatcher {
    /// Create a dispatcher with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dispatcher from the alerter configuration
    pub fn from_config(config: &AlerterConfig) -> Result<Self> {
        let mut dispatcher = Self::new();

        dispatcher.register(Box::new(
            TelegramSink::new(config.telegram.clone()).map_err(|e| Error::config(e.to_string()))?,
        ));
        dispatcher.register(Box::new(
            WebhookSink::new(config.webhook.clone()).map_err(|e| Error::config(e.to_string()))?,
        ));
        dispatcher.register(Box::new(LogSink::new(config.log.enabled)));

        Ok(dispatcher)
    }

    /// Add a sink; disabled sinks are skipped. Returns whether it was added.
    pub fn register(&mut self, sink: Box<dyn AlertSink>) -> bool {
        if !sink.enabled() {
            info!(alerter = sink.name(), "Alerter is disabled");
            return false;
        }

        info!(alerter = sink.name(), "Alerter is enabled");
        self.sinks.push(sink);
        true
    }

    /// Names of the registered sinks
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Number of registered sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Send one alert to every sink
    pub async fn dispatch(&self, alert: &Alert) -> Vec<NotificationResult> {
        let mut results = Vec::with_capacity(self.sinks.len());

        for sink in &self.sinks {
            let sent_at = Utc::now();
            let result = sink.send(alert).await;

            if let Err(e) = &result {
                error!(alerter = sink.name(), pid = alert.pid(), error = %e, "Failed to send alert");
                metrics::counter!("trafficguard_notification_failures_total", "alerter" => sink.name().to_string())
                    .increment(1);
            }

            results.push(NotificationResult {
                channel_type: sink.name().to_string(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                sent_at,
            });
        }

        results
    }

    /// Deliver queued alerts until cancelled or the queue closes
    pub async fn run(&self, mut alerts: mpsc::Receiver<Alert>, cancel: CancellationToken) {
        info!(alerters = ?self.sink_names(), "Starting alert processor");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                alert = alerts.recv() => match alert {
                    Some(alert) => {
                        self.dispatch(&alert).await;
                    }
                    None => break,
                },
            }
        }

        info!("Alert processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::notifier::NotificationError;
    use crate::models::ProcessStats;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingSink {
        name: &'static str,
        enabled: bool,
        fail: bool,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl RecordingSink {
        fn new(name: &'static str, fail: bool) -> (Self, Arc<Mutex<Vec<u32>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Self {
                name,
                enabled: true,
                fail,
                seen: Arc::clone(&seen),
            };
            (sink, seen)
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn send(&self, alert: &Alert) -> std::result::Result<(), NotificationError> {
            self.seen.lock().push(alert.pid());
            if self.fail {
                return Err(NotificationError::HttpError("connection refused".to_string()));
            }
            Ok(())
        }
    }

    fn alert(pid: u32) -> Alert {
        let now = Utc::now();
        Alert::new(ProcessStats::new(pid, now), now)
    }

    #[test]
    fn test_disabled_sinks_are_not_registered() {
        let mut dispatcher = AlertDispatcher::new();
        let (mut sink, _) = RecordingSink::new("off", false);
        sink.enabled = false;

        assert!(!dispatcher.register(Box::new(sink)));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_from_default_config_registers_log_only() {
        let dispatcher = AlertDispatcher::from_config(&AlerterConfig::default()).unwrap();
        assert_eq!(dispatcher.sink_names(), vec!["log"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_sinks() {
        let mut dispatcher = AlertDispatcher::new();
        let (failing, failing_seen) = RecordingSink::new("failing", true);
        let (working, working_seen) = RecordingSink::new("working", false);
        dispatcher.register(Box::new(failing));
        dispatcher.register(Box::new(working));

        let results = dispatcher.dispatch(&alert(42)).await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].channel_type, "failing");
        assert!(results[0].error.as_deref().unwrap().contains("connection refused"));
        assert!(results[1].success);
        assert_eq!(*failing_seen.lock(), vec![42]);
        assert_eq!(*working_seen.lock(), vec![42]);
    }

    #[tokio::test]
    async fn test_run_delivers_until_queue_closes() {
        let mut dispatcher = AlertDispatcher::new();
        let (sink, seen) = RecordingSink::new("rec", false);
        dispatcher.register(Box::new(sink));

        let (tx, rx) = mpsc::channel(4);
        for pid in [1, 2, 3] {
            tx.send(alert(pid)).await.unwrap();
        }
        drop(tx);

        dispatcher.run(rx, CancellationToken::new()).await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }
}
