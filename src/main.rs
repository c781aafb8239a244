//! echo-relay: a TCP echo server with a downstream relay
//!
//! Every chunk a client sends is:
//! - echoed back to the client with a timestamp prefix
//! - queued and relayed to a single downstream destination
//!
//! Features:
//! - Bounded relay queue with backpressure on client reads
//! - Forwarder that reconnects to the destination indefinitely
//! - Periodic throughput reports (messages and bytes, both directions)
//! - Configuration via CLI arguments or TOML file

mod aggregator;
mod config;
mod forwarder;
mod queue;
mod receiver;
mod report;
mod server;

use config::Config;
use server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        forward = %config.forward,
        queue_capacity = config.queue_capacity,
        chunk_size = config.chunk_size,
        report_interval = ?config.report_interval,
        retry_interval = ?config.retry_interval,
        max_connections = config.max_connections,
        "Starting echo-relay"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async move {
        let server = Server::bind(config).await?;
        let totals = server.run(shutdown_signal()).await?;
        info!(
            messages_received = totals.messages_received(),
            bytes_received = totals.bytes_received(),
            messages_forwarded = totals.messages_forwarded(),
            bytes_forwarded = totals.bytes_forwarded(),
            "Stopped"
        );
        Ok::<_, std::io::Error>(())
    })?;

    // Receivers still attached to clients are dropped with the runtime.
    runtime.shutdown_background();
    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
