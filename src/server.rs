//! Listener and pipeline wiring.
//!
//! The server binds the listen address, starts the forwarder and the
//! aggregator, then accepts connections in a loop and spawns one receiver
//! per client. Accept failures are logged and the loop keeps going.

use crate::aggregator::{AggregateCounters, Aggregator, Snapshot};
use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::queue::{relay_queue, RelaySender};
use crate::receiver::Receiver;
use crate::report::{report_stream, ReportSender, Side};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info};

/// Listen backlog for the client socket
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so persistent errors (e.g. EMFILE) don't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
    relay: RelaySender,
    received: ReportSender,
    forwarder: Forwarder,
    aggregator: Aggregator,
    reports: watch::Receiver<Option<Snapshot>>,
}

impl Server {
    /// Bind the listen address and build the pipeline. Nothing runs until
    /// [`Server::run`] is called.
    pub async fn bind(config: Config) -> io::Result<Self> {
        config.validate().map_err(io::Error::other)?;
        let listener = create_listener(&config.listen).await?;

        let (relay, queue) = relay_queue(config.queue_capacity);
        let (received, received_rx) = report_stream(Side::Receive, config.report_capacity());
        let (forwarded, forwarded_rx) = report_stream(Side::Forward, config.report_capacity());

        let forwarder = Forwarder::new(
            config.forward.clone(),
            config.retry_interval,
            queue,
            forwarded,
        );
        let (aggregator, reports) =
            Aggregator::new(received_rx, forwarded_rx, config.report_interval);

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            relay,
            received,
            forwarder,
            aggregator,
            reports,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Watch the periodic throughput reports.
    pub fn reports(&self) -> watch::Receiver<Option<Snapshot>> {
        self.reports.clone()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Returns the final counters after the aggregator's last report.
    pub async fn run<F>(self, shutdown: F) -> io::Result<AggregateCounters>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            connection_limit,
            relay,
            received,
            forwarder,
            aggregator,
            reports: _,
        } = self;

        info!(
            address = %config.listen,
            destination = %config.forward,
            queue_capacity = config.queue_capacity,
            chunk_size = config.chunk_size,
            "Server listening"
        );

        let (stop_aggregator, aggregator_stopped) = oneshot::channel::<()>();
        let aggregator = tokio::spawn(aggregator.run(async move {
            let _ = aggregator_stopped.await;
        }));
        let forwarder = tokio::spawn(forwarder.run());

        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = Arc::clone(&connection_limit).acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
                _ = &mut shutdown => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let receiver = Receiver::new(
                        stream,
                        peer,
                        config.chunk_size,
                        relay.clone(),
                        received.clone(),
                    );

                    tokio::spawn(async move {
                        receiver.run().await;
                        drop(permit);
                    });
                }
                Err(e) => accept_failed(&e).await,
            }
        }

        info!("Shutting down");
        forwarder.abort();
        let _ = stop_aggregator.send(());
        aggregator.await.map_err(io::Error::other)
    }
}

/// Log a failed accept and wait briefly before the loop tries again.
async fn accept_failed(e: &io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Resolve `addr` and create a listening socket with SO_REUSEADDR.
async fn create_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listen address '{addr}' did not resolve"),
        )
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
