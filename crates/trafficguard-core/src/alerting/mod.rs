//! Alerting system for TrafficGuard
//!
//! Evaluates the traffic threshold rule against the ledger and delivers the
//! resulting alerts to the configured channels.

mod dispatcher;
mod evaluator;
mod notifier;

pub use dispatcher::AlertDispatcher;
pub use evaluator::{RuleEngine, RuleSettings};
pub use notifier::{
    AlertSink, LogSink, NotificationError, NotificationResult, TelegramSink, WebhookSink,
};
