//! Runtime wiring for the traffic monitor
//!
//! Owns the bounded queues and runs every stage as its own task:
//! source → ledger ingestion, ledger sweep, rule checks, and alert delivery.
//! All tasks share one cancellation token and are joined before `run`
//! returns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerting::{AlertDispatcher, RuleEngine, RuleSettings};
use crate::collector::{EventSource, SourceStats};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Alert, TrafficEvent};
use crate::state::StateManager;

/// The assembled monitoring pipeline
pub struct Monitor {
    state: Arc<StateManager>,
    engine: Arc<RuleEngine>,
    dispatcher: Arc<AlertDispatcher>,
    event_tx: mpsc::Sender<TrafficEvent>,
    event_rx: mpsc::Receiver<TrafficEvent>,
    alert_rx: mpsc::Receiver<Alert>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Build the pipeline with sinks taken from the alerter configuration
    pub fn new(config: &Config) -> Result<Self> {
        let dispatcher = AlertDispatcher::from_config(&config.alerter)?;
        Self::with_dispatcher(config, dispatcher)
    }

    /// Build the pipeline around an already assembled dispatcher
    pub fn with_dispatcher(config: &Config, dispatcher: AlertDispatcher) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.collector.event_buffer);
        let (alert_tx, alert_rx) = mpsc::channel(config.collector.alert_buffer);

        let state = Arc::new(StateManager::new(config.rules.time_window));
        let engine = Arc::new(RuleEngine::new(
            Arc::clone(&state),
            RuleSettings::from(&config.rules),
            alert_tx,
        ));

        Ok(Self {
            state,
            engine,
            dispatcher: Arc::new(dispatcher),
            event_tx,
            event_rx,
            alert_rx,
            cancel: CancellationToken::new(),
        })
    }

    /// Shared handle to the ledger
    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Token that stops the monitor when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until the cancel token fires or the source fails
    ///
    /// A source that simply runs out of input does not stop the monitor;
    /// the ledger keeps aging and alerts keep flowing until cancellation.
    pub async fn run<S>(self, source: S) -> Result<SourceStats>
    where
        S: EventSource + 'static,
    {
        let Monitor {
            state,
            engine,
            dispatcher,
            event_tx,
            event_rx,
            alert_rx,
            cancel,
        } = self;

        info!("Starting traffic monitor");

        let mut tasks = JoinSet::new();
        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tasks.spawn(async move { state.consume(event_rx, cancel).await });
        }
        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tasks.spawn(async move { state.run_sweeper(cancel).await });
        }
        {
            let cancel = cancel.clone();
            tasks.spawn(async move { engine.run(cancel).await });
        }
        {
            let cancel = cancel.clone();
            tasks.spawn(async move { dispatcher.run(alert_rx, cancel).await });
        }

        let mut source_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(event_tx, cancel).await })
        };

        let finished = tokio::select! {
            result = &mut source_task => Some(result),
            _ = cancel.cancelled() => None,
        };

        let result = match finished {
            Some(Ok(Ok(stats))) => {
                info!("Event source finished, waiting for shutdown");
                cancel.cancelled().await;
                Ok(stats)
            }
            Some(Ok(Err(e))) => {
                error!(error = %e, "Event source failed");
                cancel.cancel();
                Err(e)
            }
            Some(Err(e)) => {
                cancel.cancel();
                Err(Error::internal(format!("event source task failed: {e}")))
            }
            None => match source_task.await {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("event source task failed: {e}"))),
            },
        };

        info!("Waiting for all services to stop...");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pipeline task failed");
            }
        }

        info!(ledger_entries = state.len(), "Traffic monitor stopped");
        result
    }
}
