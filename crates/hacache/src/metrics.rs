//! Cache counters and their statsd export.
//!
//! Counters accumulate locally in atomics; a reporter task drains them
//! every [`REPORT_INTERVAL`] and ships the deltas to a pluggable
//! [`MetricsSink`]. Each counter goes out as an increment of the
//! `ha-cache` metric tagged `m=<counter name>`, gauges as
//! `ha-cache-gauge` with the same tagging.

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence::prelude::*;
use cadence::{StatsdClient, UdpMetricSink};

/// Statsd metric name carrying all counter deltas.
const COUNTER_METRIC: &str = "ha-cache";

/// Statsd metric name carrying all gauges.
const GAUGE_METRIC: &str = "ha-cache-gauge";

/// How often the reporter drains and ships the counters.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// The cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Served a fresh entry.
    Hit,
    /// The key was absent from storage.
    Miss,
    /// Served an expired entry within the acceptable grace.
    MissExpired,
    /// Hit an entry beyond the acceptable grace.
    MissInvalid,
    /// Had to serve an invalid entry because the recompute failed.
    InvalidReturned,
    /// Invocations of the wrapped computation.
    FnRun,
    /// The wrapped computation failed on a miss.
    FnRunErr,
    /// The concurrency gate rejected an invocation.
    FnRunLimited,
    /// A refresh event was dropped because the queue was full or disabled.
    EventChanBlocked,
    /// The key function requested a cache bypass.
    Skip,
    /// The worker recovered from a panic.
    WorkerPanic,
    /// A storage read failed with something other than a miss.
    StorageErr,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::Hit,
        Metric::Miss,
        Metric::MissExpired,
        Metric::MissInvalid,
        Metric::InvalidReturned,
        Metric::FnRun,
        Metric::FnRunErr,
        Metric::FnRunLimited,
        Metric::EventChanBlocked,
        Metric::Skip,
        Metric::WorkerPanic,
        Metric::StorageErr,
    ];
}

impl AsRef<str> for Metric {
    fn as_ref(&self) -> &str {
        match self {
            Metric::Hit => "hit",
            Metric::Miss => "miss",
            Metric::MissExpired => "miss-expired",
            Metric::MissInvalid => "miss-invalid",
            Metric::InvalidReturned => "invalid-returned",
            Metric::FnRun => "fn-run",
            Metric::FnRunErr => "fn-run-err",
            Metric::FnRunLimited => "fn-run-limited",
            Metric::EventChanBlocked => "event-chan-blocked",
            Metric::Skip => "skip",
            Metric::WorkerPanic => "worker-panic",
            Metric::StorageErr => "storage-err",
        }
    }
}

/// The cache gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeMetric {
    /// Current occupancy of the computation gate.
    FnRunConcurrency,
}

impl AsRef<str> for GaugeMetric {
    fn as_ref(&self) -> &str {
        match self {
            GaugeMetric::FnRunConcurrency => "fn-run-concurrency",
        }
    }
}

/// Atomic counter block owned by one engine.
#[derive(Debug, Default)]
pub struct Stats {
    hit: AtomicI64,
    miss: AtomicI64,
    miss_expired: AtomicI64,
    miss_invalid: AtomicI64,
    invalid_returned: AtomicI64,
    fn_run: AtomicI64,
    fn_run_err: AtomicI64,
    fn_run_limited: AtomicI64,
    event_chan_blocked: AtomicI64,
    skip: AtomicI64,
    worker_panic: AtomicI64,
    storage_err: AtomicI64,

    fn_run_concurrency: AtomicI64,
}

impl Stats {
    fn counter(&self, metric: Metric) -> &AtomicI64 {
        match metric {
            Metric::Hit => &self.hit,
            Metric::Miss => &self.miss,
            Metric::MissExpired => &self.miss_expired,
            Metric::MissInvalid => &self.miss_invalid,
            Metric::InvalidReturned => &self.invalid_returned,
            Metric::FnRun => &self.fn_run,
            Metric::FnRunErr => &self.fn_run_err,
            Metric::FnRunLimited => &self.fn_run_limited,
            Metric::EventChanBlocked => &self.event_chan_blocked,
            Metric::Skip => &self.skip,
            Metric::WorkerPanic => &self.worker_panic,
            Metric::StorageErr => &self.storage_err,
        }
    }

    pub fn incr(&self, metric: Metric) {
        self.add(metric, 1);
    }

    pub fn add(&self, metric: Metric, delta: i64) {
        self.counter(metric).fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of a counter, without resetting it.
    pub fn get(&self, metric: Metric) -> i64 {
        self.counter(metric).load(Ordering::Relaxed)
    }

    pub fn gauge(&self, gauge: GaugeMetric, value: i64) {
        match gauge {
            GaugeMetric::FnRunConcurrency => {
                self.fn_run_concurrency.store(value, Ordering::Relaxed)
            }
        }
    }

    /// Drains all counters, returning the deltas accumulated since the
    /// previous export.
    pub fn export(&self) -> Vec<(Metric, i64)> {
        Metric::ALL
            .iter()
            .map(|metric| (*metric, self.counter(*metric).swap(0, Ordering::Relaxed)))
            .collect()
    }

    pub fn export_gauges(&self) -> Vec<(GaugeMetric, i64)> {
        vec![(
            GaugeMetric::FnRunConcurrency,
            self.fn_run_concurrency.load(Ordering::Relaxed),
        )]
    }
}

/// Statsd-shaped metrics transport.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, metric: &str, delta: i64, tags: &[(&str, &str)]);

    fn gauge(&self, metric: &str, value: i64, tags: &[(&str, &str)]);
}

/// [`MetricsSink`] over a nonblocking statsd UDP client.
#[derive(Debug)]
pub struct StatsdSink {
    client: StatsdClient,
}

impl StatsdSink {
    /// Connects a nonblocking UDP socket to the statsd `host`.
    pub fn new<A: ToSocketAddrs>(prefix: &str, host: A) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from(host, socket)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(StatsdSink {
            client: StatsdClient::from_sink(prefix, sink),
        })
    }
}

impl MetricsSink for StatsdSink {
    fn incr(&self, metric: &str, delta: i64, tags: &[(&str, &str)]) {
        let mut builder = self.client.count_with_tags(metric, delta);
        for (tag, value) in tags {
            builder = builder.with_tag(tag, value);
        }
        builder.send();
    }

    fn gauge(&self, metric: &str, value: i64, tags: &[(&str, &str)]) {
        let mut builder = self.client.gauge_with_tags(metric, value.max(0) as u64);
        for (tag, value) in tags {
            builder = builder.with_tag(tag, value);
        }
        builder.send();
    }
}

/// Spawns the periodic export task.
///
/// The task holds the stats weakly and exits once the owning engine is
/// gone.
pub(crate) fn spawn_reporter(stats: &Arc<Stats>, sink: Arc<dyn MetricsSink>) {
    let stats = Arc::downgrade(stats);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        // The first tick fires immediately; skip it so the first report
        // covers a full interval.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(stats) = stats.upgrade() else {
                break;
            };

            for (metric, delta) in stats.export() {
                if delta == 0 {
                    continue;
                }
                sink.incr(COUNTER_METRIC, delta, &[("m", metric.as_ref())]);
            }

            for (gauge, value) in stats.export_gauges() {
                sink.gauge(GAUGE_METRIC, value, &[("m", gauge.as_ref())]);
            }
        }

        tracing::debug!("metrics reporter terminated");
    });
}
