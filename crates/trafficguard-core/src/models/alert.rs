//! Alert data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::traffic::ProcessStats;

/// A threshold crossing raised by the rule engine
///
/// Alerts are immutable snapshots. Cooldown bookkeeping stays inside the
/// rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Ledger entry at the moment the rule fired
    pub process_stats: ProcessStats,

    /// When the rule fired
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert for a ledger entry
    pub fn new(process_stats: ProcessStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            process_stats,
            timestamp,
        }
    }

    /// PID the alert is about
    pub fn pid(&self) -> u32 {
        self.process_stats.pid
    }

    /// Total traffic in MiB
    pub fn total_mb(&self) -> f64 {
        self.process_stats.total_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Wire form handed to external sinks
    pub fn payload(&self) -> AlertPayload {
        AlertPayload {
            pid: self.process_stats.pid,
            process_name: self.process_stats.process_name.clone(),
            total_bytes: self.process_stats.total_bytes,
            timestamp: self.timestamp.to_rfc3339(),
        }
    }
}

/// Outbound alert contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub total_bytes: u64,
    /// RFC 3339 timestamp
    pub timestamp: String,
}
