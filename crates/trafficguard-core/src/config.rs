//! Configuration management for TrafficGuard
//!
//! Settings are layered: built-in defaults, then an optional file (format
//! picked by extension), then `TRAFFICGUARD__`-prefixed environment variables
//! such as `TRAFFICGUARD__RULES__TRAFFIC_THRESHOLD_MB=50`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Threshold rule configuration
    pub rules: RulesConfig,

    /// Queue sizing between pipeline stages
    pub collector: CollectorConfig,

    /// Alert delivery channels
    pub alerter: AlerterConfig,

    /// Self-monitoring metrics
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and validate configuration from defaults, an optional file, and
    /// the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration layers without validating them
    ///
    /// Unknown keys are rejected, so a misspelled or retired setting fails
    /// here instead of silently falling back to its default.
    pub fn read(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TRAFFICGUARD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Check the values the pipeline depends on
    pub fn validate(&self) -> Result<()> {
        self.rules.validate()?;

        if self.collector.event_buffer == 0 {
            return Err(Error::validation("collector.event_buffer must be positive"));
        }
        if self.collector.alert_buffer == 0 {
            return Err(Error::validation("collector.alert_buffer must be positive"));
        }

        let telegram = &self.alerter.telegram;
        if telegram.enabled && (telegram.bot_token.is_empty() || telegram.chat_id.is_empty()) {
            return Err(Error::validation(
                "alerter.telegram requires bot_token and chat_id when enabled",
            ));
        }

        let webhook = &self.alerter.webhook;
        if webhook.enabled && webhook.url.is_empty() {
            return Err(Error::validation("alerter.webhook requires url when enabled"));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Traffic threshold rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesConfig {
    /// Alert when a process moves more than this many MiB inside the window
    pub traffic_threshold_mb: u64,
    /// Idle time after which a process's ledger entry is dropped
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    /// How often the ledger is checked against the threshold
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Minimum time between two alerts for the same process
    #[serde(with = "humantime_serde")]
    pub alert_cooldown: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            traffic_threshold_mb: 10,
            time_window: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(10),
            alert_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

impl RulesConfig {
    /// Threshold converted to bytes
    pub fn threshold_bytes(&self) -> u64 {
        self.traffic_threshold_mb.saturating_mul(BYTES_PER_MB)
    }

    fn validate(&self) -> Result<()> {
        if self.traffic_threshold_mb == 0 {
            return Err(Error::validation("rules.traffic_threshold_mb must be positive"));
        }
        if self.time_window.is_zero() {
            return Err(Error::validation("rules.time_window must be positive"));
        }
        if self.check_interval.is_zero() {
            return Err(Error::validation("rules.check_interval must be positive"));
        }
        if self.check_interval > self.time_window {
            warn!(
                check_interval = %humantime::format_duration(self.check_interval),
                time_window = %humantime::format_duration(self.time_window),
                "Check interval is longer than the time window; short bursts may expire unchecked"
            );
        }
        Ok(())
    }
}

/// Queue sizing between pipeline stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    /// Capacity of the event queue between the source and the ledger
    pub event_buffer: usize,
    /// Capacity of the alert queue between the rule engine and the sinks
    pub alert_buffer: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            event_buffer: 100,
            alert_buffer: 10,
        }
    }
}

/// Alert channels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlerterConfig {
    /// Telegram bot channel
    pub telegram: TelegramConfig,
    /// Generic JSON webhook
    pub webhook: WebhookConfig,
    /// Write alerts to the log
    pub log: LogSinkConfig,
}

/// Telegram bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    /// Bot API base URL
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

/// Generic webhook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
}

/// Log sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSinkConfig {
    pub enabled: bool,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Self-monitoring metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on this address
    pub prometheus_listen: Option<SocketAddr>,
}
