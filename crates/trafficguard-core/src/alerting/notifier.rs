//! Notification delivery for alerts

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{TelegramConfig, WebhookConfig};
use crate::models::Alert;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A channel that can deliver alerts
///
/// The dispatcher only sees this trait; concrete channels are registered at
/// startup.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short channel name used in logs and results
    fn name(&self) -> &str;

    /// Whether the channel is switched on
    fn enabled(&self) -> bool;

    /// Deliver one alert
    async fn send(&self, alert: &Alert) -> Result<(), NotificationError>;
}

/// Result of sending a notification
#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub channel_type: String,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("{channel} returned {status}: {body}")]
    Status {
        channel: String,
        status: u16,
        body: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn http_client() -> Result<Client, NotificationError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| NotificationError::ConfigError(format!("failed to create HTTP client: {e}")))
}

async fn check_status(channel: &str, response: reqwest::Response) -> Result<(), NotificationError> {
    if response.status().is_success() {
        return Ok(());
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(NotificationError::Status {
        channel: channel.to_string(),
        status,
        body,
    })
}

/// Sends alerts through a Telegram bot
pub struct TelegramSink {
    config: TelegramConfig,
    client: Client,
}

impl TelegramSink {
    /// Create a Telegram sink
    pub fn new(config: TelegramConfig) -> Result<Self, NotificationError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    fn format_message(alert: &Alert) -> String {
        let process = alert
            .process_stats
            .process_name
            .as_deref()
            .map(|name| format!("**Process:** {}\n", escape_markdown(name)))
            .unwrap_or_default();

        format!(
            "🚨 **Traffic Alert** 🚨\n\n\
             **Process ID:** `{}`\n\
             {}\
             **Traffic Used:** `{:.2} MB`\n\
             **Time:** `{}`\n\n\
             The process has exceeded the configured traffic limit.",
            alert.pid(),
            process,
            alert.total_mb(),
            alert.timestamp.format("%a, %d %b %Y %H:%M:%S UTC"),
        )
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );

        let payload = TelegramPayload {
            chat_id: &self.config.chat_id,
            text: Self::format_message(alert),
            parse_mode: "Markdown",
        };

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            // the request URL carries the bot token
            .map_err(|e| NotificationError::HttpError(e.without_url().to_string()))?;

        check_status("Telegram", response).await?;

        info!(pid = alert.pid(), "Telegram notification sent");
        Ok(())
    }
}

/// Posts the alert contract as JSON to a URL
pub struct WebhookSink {
    config: WebhookConfig,
    client: Client,
}

impl WebhookSink {
    /// Create a webhook sink
    pub fn new(config: WebhookConfig) -> Result<Self, NotificationError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.config.headers
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.config.url).json(&alert.payload());

        for (key, value) in self.headers() {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        check_status("Webhook", response).await?;

        info!(pid = alert.pid(), url = %self.config.url, "Webhook notification sent");
        Ok(())
    }
}

/// Writes alerts to the log
#[derive(Debug, Clone, Copy)]
pub struct LogSink {
    enabled: bool,
}

impl LogSink {
    /// Create a log sink
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        warn!(
            pid = alert.pid(),
            process = alert.process_stats.process_name.as_deref().unwrap_or("-"),
            total_bytes = alert.process_stats.total_bytes,
            timestamp = %alert.timestamp.to_rfc3339(),
            "Traffic alert"
        );
        Ok(())
    }
}

/// Escape the entity characters of Telegram's legacy Markdown
fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Debug, Serialize)]
struct TelegramPayload<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'a str,
}
