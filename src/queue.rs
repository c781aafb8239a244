//! Bounded relay queue between the receivers and the forwarder.
//!
//! Many receivers submit chunks, one forwarder takes them in FIFO order.
//! Submitting to a full queue waits for space instead of dropping data,
//! so a slow destination throttles every client's reads.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A chunk of bytes read from one client in a single read.
pub type Chunk = Bytes;

/// Create a relay queue holding at most `capacity` chunks.
pub fn relay_queue(capacity: usize) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (RelaySender { tx }, RelayReceiver { rx })
}

/// Producer handle, cloned into every receiver.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<Chunk>,
}

impl RelaySender {
    /// Enqueue a chunk, waiting while the queue is full.
    ///
    /// Returns the chunk back if the forwarder has gone away.
    pub async fn submit(&self, chunk: Chunk) -> Result<(), Chunk> {
        self.tx.send(chunk).await.map_err(|e| e.0)
    }

    /// Number of chunks that can be submitted without waiting.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer handle, owned by the forwarder.
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::Receiver<Chunk>,
}

impl RelayReceiver {
    /// Wait for the next chunk. Returns `None` once every sender is dropped
    /// and the queue is drained.
    pub async fn take(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }
}
