//! # TrafficGuard
//!
//! Per-process network traffic monitor with threshold alerting.
//!
//! TrafficGuard folds a stream of per-transfer byte counts into a
//! time-windowed ledger keyed by PID, checks the ledger against a traffic
//! threshold on a fixed cadence, and raises at most one alert per process
//! per cooldown period.
//!
//! ## Architecture
//!
//! - **Collector**: decodes traffic records into the bounded event queue
//! - **State**: concurrent ledger with periodic sweep of idle processes
//! - **Alerting**: threshold rule engine, cooldown tracking, alert sinks
//! - **Monitor**: runs every stage as a task under one cancellation token
//!
//! ## Known limitations
//!
//! PIDs are not disambiguated by process start time. When the kernel reuses
//! a PID inside the window, the new process inherits the old ledger entry and
//! any live cooldown.
//!
//! ## Quick Start
//!
//! ```bash
//! # Feed newline-delimited JSON records from a probe loader
//! probe-loader | trafficguard run --config trafficguard.yaml
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod monitor;
pub mod state;

pub use crate::config::Config;
pub use crate::error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertDispatcher, AlertSink, RuleEngine, RuleSettings};
    pub use crate::collector::{EventSource, LineSource};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::monitor::Monitor;
    pub use crate::state::StateManager;
}
