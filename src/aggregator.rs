//! Throughput aggregation.
//!
//! The aggregator is the only owner of the running totals. It consumes the
//! receive-side and forward-side report streams and, on a fixed timer,
//! logs a snapshot of the four counters and publishes it on a watch channel.

use crate::receiver::TIMESTAMP_FORMAT;
use crate::report::{ReportEvent, ReportReceiver, Side};
use chrono::{DateTime, Local};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Running totals for the process lifetime. Never reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregateCounters {
    messages_received: u64,
    bytes_received: u64,
    messages_forwarded: u64,
    bytes_forwarded: u64,
}

impl AggregateCounters {
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn messages_forwarded(&self) -> u64 {
        self.messages_forwarded
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    fn apply(&mut self, side: Side, event: ReportEvent) {
        let bytes = event.bytes as u64;
        match side {
            Side::Receive => {
                self.messages_received += 1;
                self.bytes_received += bytes;
            }
            Side::Forward => {
                self.messages_forwarded += 1;
                self.bytes_forwarded += bytes;
            }
        }
    }

    fn snapshot(&self, at: DateTime<Local>) -> Snapshot {
        Snapshot {
            at,
            messages_received: self.messages_received,
            bytes_received: self.bytes_received,
            messages_forwarded: self.messages_forwarded,
            bytes_forwarded: self.bytes_forwarded,
        }
    }
}

/// Counters as of one report tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub at: DateTime<Local>,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_forwarded: u64,
    pub bytes_forwarded: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] messages recv: {} bytes recv: {} messages forwarded: {} bytes forwarded: {}",
            self.at.format(TIMESTAMP_FORMAT),
            self.messages_received,
            self.bytes_received,
            self.messages_forwarded,
            self.bytes_forwarded,
        )
    }
}

/// Consumer of both report streams.
pub struct Aggregator {
    received: ReportReceiver,
    forwarded: ReportReceiver,
    interval: Duration,
    counters: AggregateCounters,
    published: watch::Sender<Option<Snapshot>>,
}

impl Aggregator {
    /// Create an aggregator reporting every `interval`.
    ///
    /// The returned watch receiver sees every snapshot the aggregator logs.
    pub fn new(
        received: ReportReceiver,
        forwarded: ReportReceiver,
        interval: Duration,
    ) -> (Self, watch::Receiver<Option<Snapshot>>) {
        debug_assert_eq!(received.side(), Side::Receive);
        debug_assert_eq!(forwarded.side(), Side::Forward);

        let (published, reports) = watch::channel(None);
        let aggregator = Aggregator {
            received,
            forwarded,
            interval,
            counters: AggregateCounters::default(),
            published,
        };
        (aggregator, reports)
    }

    /// Accumulate until `shutdown` resolves or both streams close, then emit
    /// one final report and return the totals.
    pub async fn run<F>(mut self, shutdown: F) -> AggregateCounters
    where
        F: Future<Output = ()>,
    {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut receive_open = true;
        let mut forward_open = true;

        // select! polls ready branches in random order, so a busy stream
        // cannot starve the other stream or the timer.
        loop {
            tokio::select! {
                event = self.received.next(), if receive_open => match event {
                    Some(event) => self.counters.apply(Side::Receive, event),
                    None => receive_open = false,
                },
                event = self.forwarded.next(), if forward_open => match event {
                    Some(event) => self.counters.apply(Side::Forward, event),
                    None => forward_open = false,
                },
                _ = ticker.tick() => self.emit(),
                _ = &mut shutdown => {
                    debug!("Aggregator shutting down");
                    break;
                }
            }

            if !receive_open && !forward_open {
                debug!("All report streams closed");
                break;
            }
        }

        self.drain();
        self.emit();
        self.counters
    }

    fn drain(&mut self) {
        while let Some(event) = self.received.try_next() {
            self.counters.apply(Side::Receive, event);
        }
        while let Some(event) = self.forwarded.try_next() {
            self.counters.apply(Side::Forward, event);
        }
    }

    fn emit(&self) {
        let snapshot = self.counters.snapshot(Local::now());
        info!(
            messages_received = snapshot.messages_received,
            bytes_received = snapshot.bytes_received,
            messages_forwarded = snapshot.messages_forwarded,
            bytes_forwarded = snapshot.bytes_forwarded,
            "{snapshot}"
        );
        self.published.send_replace(Some(snapshot));
    }
}
