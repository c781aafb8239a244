//! Per-connection receiver.
//!
//! Each accepted client gets its own receiver task which loops over:
//! read one chunk, echo it back with a timestamp prefix, report the byte
//! count, then submit a copy to the relay queue. Any I/O failure or EOF
//! ends the session and closes the socket.

use crate::queue::RelaySender;
use crate::report::ReportSender;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Format of the timestamp in echo prefixes and throughput reports.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f %z";

/// Build the echo response for one chunk: `[<timestamp>] <chunk>`.
pub fn echo_payload(at: DateTime<Local>, chunk: &[u8]) -> BytesMut {
    let stamp = at.format(TIMESTAMP_FORMAT).to_string();
    let mut response = BytesMut::with_capacity(stamp.len() + 3 + chunk.len());
    response.put_u8(b'[');
    response.extend_from_slice(stamp.as_bytes());
    response.extend_from_slice(b"] ");
    response.extend_from_slice(chunk);
    response
}

/// Why a receiver stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// Client closed its side.
    Eof,
    /// Reading from the client failed.
    ReadError(std::io::Error),
    /// Writing the echo failed.
    EchoError(std::io::Error),
    /// The forwarder is gone and the chunk could not be queued.
    RelayClosed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "closed by client"),
            CloseReason::ReadError(e) => write!(f, "read error: {e}"),
            CloseReason::EchoError(e) => write!(f, "error echoing: {e}"),
            CloseReason::RelayClosed => write!(f, "relay queue closed"),
        }
    }
}

/// Receiver for one client connection.
pub struct Receiver {
    stream: TcpStream,
    peer: SocketAddr,
    chunk_size: usize,
    relay: RelaySender,
    report: ReportSender,
}

impl Receiver {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        chunk_size: usize,
        relay: RelaySender,
        report: ReportSender,
    ) -> Self {
        Self {
            stream,
            peer,
            chunk_size,
            relay,
            report,
        }
    }

    /// Serve the connection until it closes. The socket is dropped, and so
    /// closed, on every return path.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.serve().await;
        debug!(peer = %self.peer, reason = %reason, "Connection closed");
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        let mut buffer = BytesMut::zeroed(self.chunk_size);

        loop {
            let n = match self.stream.read(&mut buffer[..]).await {
                Ok(0) => return CloseReason::Eof,
                Ok(n) => n,
                Err(e) => return CloseReason::ReadError(e),
            };
            let chunk = buffer.split_to(n).freeze();
            buffer.resize(self.chunk_size, 0);
            trace!(peer = %self.peer, bytes = n, "Received chunk");

            let echo = echo_payload(Local::now(), &chunk);
            if let Err(e) = self.stream.write_all(&echo).await {
                return CloseReason::EchoError(e);
            }

            self.report.record(n).await;

            // Waits while the queue is full; this is what throttles reads
            // from this client when the destination is slow.
            if self.relay.available() == 0 {
                trace!(peer = %self.peer, "Relay queue full, waiting");
            }
            if self.relay.submit(chunk).await.is_err() {
                return CloseReason::RelayClosed;
            }
        }
    }
}
