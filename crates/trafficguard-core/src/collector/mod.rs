//! Collector module - traffic event ingestion
//!
//! An event source turns some upstream feed (a kernel probe loader, a FIFO,
//! a recorded trace) into `TrafficEvent`s on the bounded event queue.
//! Backpressure is the source's business: sending blocks when the queue is
//! full.

mod lines;

pub use lines::LineSource;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::TrafficEvent;

/// Counters a source reports when it finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Events handed to the ledger
    pub forwarded: u64,
    /// Records rejected by the decoder
    pub malformed: u64,
    /// Samples the upstream reported as lost
    pub lost_samples: u64,
}

/// Producer of traffic events
#[async_trait::async_trait]
pub trait EventSource: Send {
    /// Push events into `tx` until the input ends, the queue closes, or
    /// `cancel` fires
    async fn run(self, tx: mpsc::Sender<TrafficEvent>, cancel: CancellationToken) -> Result<SourceStats>;
}
