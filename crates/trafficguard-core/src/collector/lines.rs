//! Newline-delimited JSON event source
//!
//! Each line is either a sample
//! `{"pid": 42, "bytes": 1500, "direction": "send", "process_name": "curl"}`
//! or a loss report from the upstream ring buffer `{"lost_samples": 17}`.

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::TrafficEvent;

use super::{EventSource, SourceStats};

const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceRecord {
    Lost { lost_samples: u64 },
    Sample(TrafficEvent),
}

/// Reads traffic records line by line from any async reader
pub struct LineSource<R> {
    reader: R,
    max_line_length: usize,
}

impl<R> LineSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create a source over `reader`
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Reject lines longer than `max` bytes
    #[must_use]
    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }
}

#[async_trait::async_trait]
impl<R> EventSource for LineSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn run(self, tx: mpsc::Sender<TrafficEvent>, cancel: CancellationToken) -> Result<SourceStats> {
        info!("Starting event source");

        let Self {
            reader,
            max_line_length,
        } = self;
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length));
        let mut stats = SourceStats::default();
        // the framed reader yields one `None` after a decode error, then resumes
        let mut recovering = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = lines.next() => next,
            };

            let line = match next {
                None if recovering => {
                    recovering = false;
                    continue;
                }
                None => {
                    info!("Event source reached end of input");
                    break;
                }
                Some(Ok(line)) => {
                    recovering = false;
                    line
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    recovering = true;
                    stats.malformed += 1;
                    metrics::counter!("trafficguard_malformed_records_total").increment(1);
                    warn!(max = max_line_length, "Dropping oversized record");
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<SourceRecord>(line) {
                Ok(SourceRecord::Sample(event)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        debug!("Event queue closed");
                        break;
                    }
                    stats.forwarded += 1;
                }
                Ok(SourceRecord::Lost { lost_samples }) => {
                    stats.lost_samples += lost_samples;
                    metrics::counter!("trafficguard_lost_samples_total").increment(lost_samples);
                    warn!(count = lost_samples, "Upstream lost samples");
                }
                Err(e) => {
                    stats.malformed += 1;
                    metrics::counter!("trafficguard_malformed_records_total").increment(1);
                    warn!(error = %e, "Dropping malformed record");
                }
            }
        }

        info!(
            forwarded = stats.forwarded,
            malformed = stats.malformed,
            lost_samples = stats.lost_samples,
            "Event source stopped"
        );
        Ok(stats)
    }
}
