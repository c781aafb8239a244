//! Report streams feeding the aggregator.
//!
//! Each successful read or write emits one event carrying the byte count.
//! There is one stream per side of the pipeline.

use tokio::sync::mpsc;

/// Which side of the pipeline an event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Receive,
    Forward,
}

/// Bytes processed by one I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportEvent {
    pub bytes: usize,
}

/// Create a report stream for `side` buffering up to `capacity` events.
pub fn report_stream(side: Side, capacity: usize) -> (ReportSender, ReportReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReportSender { side, tx }, ReportReceiver { side, rx })
}

#[derive(Debug, Clone)]
pub struct ReportSender {
    side: Side,
    tx: mpsc::Sender<ReportEvent>,
}

impl ReportSender {
    /// Record `bytes` processed. A stopped aggregator is not an error for
    /// the I/O path, so a closed stream is ignored.
    pub async fn record(&self, bytes: usize) {
        if self.tx.send(ReportEvent { bytes }).await.is_err() {
            tracing::trace!(side = ?self.side, bytes, "Report stream closed");
        }
    }
}

#[derive(Debug)]
pub struct ReportReceiver {
    side: Side,
    rx: mpsc::Receiver<ReportEvent>,
}

impl ReportReceiver {
    pub fn side(&self) -> Side {
        self.side
    }

    pub async fn next(&mut self) -> Option<ReportEvent> {
        self.rx.recv().await
    }

    /// Take an already-buffered event without waiting.
    pub fn try_next(&mut self) -> Option<ReportEvent> {
        self.rx.try_recv().ok()
    }
}
