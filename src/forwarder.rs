//! Forwarder: the single outbound leg of the relay.
//!
//! The forwarder owns the only connection to the destination and is the
//! only consumer of the relay queue. It runs as an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (write failure)
//!                   ^    |
//!                   +----+ (connect failure, wait retry_interval)
//! ```
//!
//! Delivery is at most once: a chunk whose write fails is dropped and the
//! forwarder resumes with the next queued chunk after reconnecting.

use crate::queue::RelayReceiver;
use crate::report::ReportSender;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Connection state of the forwarder.
#[derive(Debug)]
pub enum ForwarderState {
    /// No connection; the next step starts connecting.
    Disconnected,
    /// Attempting to open the outbound connection.
    Connecting,
    /// Draining the relay queue into the open connection.
    Connected(TcpStream),
}

/// Relays queued chunks to one destination, reconnecting forever.
pub struct Forwarder {
    destination: String,
    retry_interval: Duration,
    queue: RelayReceiver,
    report: ReportSender,
}

impl Forwarder {
    pub fn new(
        destination: String,
        retry_interval: Duration,
        queue: RelayReceiver,
        report: ReportSender,
    ) -> Self {
        Self {
            destination,
            retry_interval,
            queue,
            report,
        }
    }

    /// Run until the relay queue is closed.
    pub async fn run(mut self) {
        let mut state = ForwarderState::Disconnected;
        while let Some(next) = self.step(state).await {
            state = next;
        }
        info!(destination = %self.destination, "Relay queue closed, forwarder stopping");
    }

    /// Advance the state machine by one transition.
    ///
    /// Returns `None` when the relay queue is closed and drained.
    pub async fn step(&mut self, state: ForwarderState) -> Option<ForwarderState> {
        match state {
            ForwarderState::Disconnected => Some(ForwarderState::Connecting),
            ForwarderState::Connecting => Some(self.connect().await),
            ForwarderState::Connected(stream) => self.forward_one(stream).await,
        }
    }

    async fn connect(&self) -> ForwarderState {
        match TcpStream::connect(&self.destination).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                info!(destination = %self.destination, "Connected to forward host");
                ForwarderState::Connected(stream)
            }
            Err(e) => {
                warn!(
                    destination = %self.destination,
                    error = %e,
                    retry_in = ?self.retry_interval,
                    "Can't connect to forward host yet"
                );
                tokio::time::sleep(self.retry_interval).await;
                ForwarderState::Connecting
            }
        }
    }

    async fn forward_one(&mut self, mut stream: TcpStream) -> Option<ForwarderState> {
        let chunk = self.queue.take().await?;

        match stream.write_all(&chunk).await {
            Ok(()) => {
                trace!(bytes = chunk.len(), "Forwarded chunk");
                self.report.record(chunk.len()).await;
                Some(ForwarderState::Connected(stream))
            }
            Err(e) => {
                warn!(
                    destination = %self.destination,
                    error = %e,
                    dropped_bytes = chunk.len(),
                    "Forward write failed, reconnecting"
                );
                Some(ForwarderState::Disconnected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{relay_queue, RelaySender};
    use crate::report::{report_stream, ReportEvent, ReportReceiver, Side};
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn forwarder(destination: SocketAddr) -> (Forwarder, RelaySender, ReportReceiver) {
        forwarder_with_retry(destination, Duration::from_millis(20))
    }

    fn forwarder_with_retry(
        destination: SocketAddr,
        retry_interval: Duration,
    ) -> (Forwarder, RelaySender, ReportReceiver) {
        let (relay_tx, relay_rx) = relay_queue(64);
        let (report_tx, report_rx) = report_stream(Side::Forward, 64);
        let forwarder =
            Forwarder::new(destination.to_string(), retry_interval, relay_rx, report_tx);
        (forwarder, relay_tx, report_rx)
    }

    /// An address nothing is listening on.
    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_disconnected_moves_to_connecting() {
        let (mut fwd, _tx, _reports) = forwarder(closed_addr().await);
        let next = fwd.step(ForwarderState::Disconnected).await;
        assert!(matches!(next, Some(ForwarderState::Connecting)));
    }

    #[tokio::test]
    async fn test_connect_failure_stays_connecting() {
        let (mut fwd, _tx, _reports) = forwarder(closed_addr().await);
        let next = timeout(WAIT, fwd.step(ForwarderState::Connecting))
            .await
            .unwrap();
        assert!(matches!(next, Some(ForwarderState::Connecting)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_waits_retry_interval() {
        let retry_interval = Duration::from_secs(3);
        let (mut fwd, _tx, _reports) =
            forwarder_with_retry(closed_addr().await, retry_interval);

        // Not done before the interval has passed.
        let early = timeout(retry_interval / 2, fwd.step(ForwarderState::Connecting)).await;
        assert!(early.is_err());

        let start = tokio::time::Instant::now();
        let next = fwd.step(ForwarderState::Connecting).await;
        assert!(matches!(next, Some(ForwarderState::Connecting)));
        let waited = start.elapsed();
        assert!(waited >= retry_interval, "waited {waited:?}");
        assert!(waited < retry_interval * 2, "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_connected_forwards_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut fwd, tx, mut reports) = forwarder(listener.local_addr().unwrap());

        let state = fwd.step(ForwarderState::Connecting).await.unwrap();
        assert!(matches!(state, ForwarderState::Connected(_)));
        let (mut dest, _) = listener.accept().await.unwrap();

        tx.submit(Bytes::from_static(b"one")).await.unwrap();
        tx.submit(Bytes::from_static(b"two")).await.unwrap();

        let state = fwd.step(state).await.unwrap();
        let state = fwd.step(state).await.unwrap();
        assert!(matches!(state, ForwarderState::Connected(_)));

        let mut buf = [0u8; 6];
        timeout(WAIT, dest.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"onetwo");
        assert_eq!(reports.next().await, Some(ReportEvent { bytes: 3 }));
        assert_eq!(reports.next().await, Some(ReportEvent { bytes: 3 }));

        drop(tx);
        assert!(fwd.step(state).await.is_none());
    }

    #[tokio::test]
    async fn test_retries_until_destination_appears() {
        let addr = closed_addr().await;
        let (fwd, tx, mut reports) = forwarder(addr);
        let handle = tokio::spawn(fwd.run());

        tx.submit(Bytes::from_static(b"hello")).await.unwrap();
        // Let several connection attempts fail first.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut dest, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        let mut buf = [0u8; 5];
        timeout(WAIT, dest.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(reports.next().await, Some(ReportEvent { bytes: 5 }));

        drop(tx);
        timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_chunk_is_dropped_not_resent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut fwd, tx, mut reports) = forwarder(listener.local_addr().unwrap());

        let state = fwd.step(ForwarderState::Connecting).await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        // Linger 0 makes the close send RST, so the next write fails.
        socket2::SockRef::from(&first)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.submit(Bytes::from_static(b"lost")).await.unwrap();
        let state = timeout(WAIT, fwd.step(state)).await.unwrap().unwrap();
        assert!(matches!(state, ForwarderState::Disconnected));
        assert_eq!(reports.try_next(), None);

        let state = fwd.step(state).await.unwrap();
        let state = fwd.step(state).await.unwrap();
        assert!(matches!(state, ForwarderState::Connected(_)));
        let (mut second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        tx.submit(Bytes::from_static(b"next")).await.unwrap();
        let state = fwd.step(state).await.unwrap();
        assert!(matches!(state, ForwarderState::Connected(_)));

        let mut buf = [0u8; 4];
        timeout(WAIT, second.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"next");
        assert_eq!(reports.next().await, Some(ReportEvent { bytes: 4 }));
        assert_eq!(reports.try_next(), None);

        drop(state);
        let mut rest = Vec::new();
        timeout(WAIT, second.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_write_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (fwd, tx, _reports) = forwarder(listener.local_addr().unwrap());
        tokio::spawn(fwd.run());

        let producer = tokio::spawn(async move {
            for _ in 0..1000 {
                if tx.submit(Bytes::from_static(b"x")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        // First connection is dropped by the destination right away, which
        // makes a later write fail.
        let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        drop(first);

        let (mut second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut buf = [0u8; 1];
        timeout(WAIT, second.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"x");

        producer.abort();
    }
}
