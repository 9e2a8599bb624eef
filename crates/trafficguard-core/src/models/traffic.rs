//! Traffic event and per-process ledger models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of an observed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Egress from the process
    #[serde(alias = "tx")]
    Send,
    /// Ingress to the process
    #[serde(alias = "rx")]
    Receive,
}

/// One observed transfer attributed to a process
///
/// PIDs are not unique over the host's lifetime. A reused PID lands on the
/// same ledger key as its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEvent {
    /// Process identifier
    pub pid: u32,

    /// Bytes attributable to this transfer
    #[serde(alias = "len")]
    pub bytes: u64,

    /// Transfer direction, if the source knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,

    /// Process command name, if the source knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
}

impl TrafficEvent {
    /// Create an event with no direction or name attached
    pub fn new(pid: u32, bytes: u64) -> Self {
        Self {
            pid,
            bytes,
            direction: None,
            process_name: None,
        }
    }

    /// Attach a transfer direction
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Attach a process name
    #[must_use]
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }
}

/// Accumulated traffic for one process inside the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Process identifier
    pub pid: u32,

    /// Sum of all bytes seen since the entry was created
    pub total_bytes: u64,

    /// Bytes from events tagged as sent
    pub sent_bytes: u64,

    /// Bytes from events tagged as received
    pub received_bytes: u64,

    /// Most recent process name reported for this PID
    pub process_name: Option<String>,

    /// Time of the most recent event
    pub last_seen: DateTime<Utc>,
}

impl ProcessStats {
    /// Create an empty entry
    pub fn new(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            total_bytes: 0,
            sent_bytes: 0,
            received_bytes: 0,
            process_name: None,
            last_seen: now,
        }
    }

    /// Fold an event into the totals and refresh `last_seen`
    pub fn record(&mut self, event: &TrafficEvent, now: DateTime<Utc>) {
        self.total_bytes = self.total_bytes.saturating_add(event.bytes);

        match event.direction {
            Some(Direction::Send) => {
                self.sent_bytes = self.sent_bytes.saturating_add(event.bytes);
            }
            Some(Direction::Receive) => {
                self.received_bytes = self.received_bytes.saturating_add(event.bytes);
            }
            None => {}
        }

        if let Some(name) = event.process_name.as_deref().filter(|n| !n.is_empty()) {
            if self.process_name.as_deref() != Some(name) {
                self.process_name = Some(name.to_string());
            }
        }

        self.last_seen = now;
    }

    /// Whether the entry has been idle for longer than `window` at `now`
    pub fn is_idle(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        elapsed(self.last_seen, now) > window
    }
}

/// Time from `earlier` to `now`, clamped to zero when the clock went backwards
pub(crate) fn elapsed(earlier: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - earlier).to_std().unwrap_or_default()
}
