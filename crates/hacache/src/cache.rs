//! The cache engine.
//!
//! One [`HaCache`] wraps one computation. A [`fetch`](HaCache::fetch)
//! derives the cache key, reads storage, classifies the stored envelope
//! by age, and picks one of three paths:
//!
//! - fresh: decode and return, nothing else happens;
//! - acceptably stale: decode and return the stored value, schedule a
//!   background [`Event::Refresh`];
//! - invalid (or missing): run the computation in the foreground through
//!   the concurrency gate, return its result, and schedule an
//!   [`Event::Fill`] with the computed value — unless the computation (or
//!   its [`CallContext`]) vetoed caching.
//!
//! When the foreground computation on the invalid path fails or is
//! rejected by the gate, the outdated envelope is served anyway: an old
//! answer beats an error.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::context::CallContext;
use crate::envelope::{unix_timestamp, CachedValue, Freshness};
use crate::error::Error;
use crate::events::{self, Event};
use crate::limiter::Limiter;
use crate::metrics::{spawn_reporter, GaugeMetric, Metric, MetricsSink, Stats};
use crate::storage::{Storage, StorageError};

/// Key sentinel: bypass the cache entirely for this call.
pub const SKIP_CACHE: &str = "__hacache_skip_cache__";

/// The outcome of one invocation of the wrapped computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnResult<T> {
    pub value: T,
    /// The value was computed fine but must not be cached.
    pub ignore: bool,
}

impl<T> FnResult<T> {
    pub fn new(value: T) -> Self {
        FnResult {
            value,
            ignore: false,
        }
    }

    /// A successful result that must not be cached. Structural twin of
    /// [`CallContext::ignore_result`]; the engine honors either.
    pub fn uncached(value: T) -> Self {
        FnResult {
            value,
            ignore: true,
        }
    }
}

/// The wrapped computation plus its key function.
///
/// Both operate on the same argument tuple. The key function decides how
/// invocations map onto storage; two argument values with the same key
/// share a cache entry.
pub trait CachedFn: Send + Sync + 'static {
    type Args: Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Derives the cache key for `args`.
    ///
    /// An empty string marks the key as invalid and fails the call;
    /// [`SKIP_CACHE`] bypasses the cache for this call.
    fn cache_key(&self, args: &Self::Args) -> String;

    /// Runs the underlying computation.
    fn run<'a>(
        &'a self,
        ctx: &'a CallContext,
        args: &'a Self::Args,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<Self::Value>>>;
}

/// Everything a [`HaCache`] needs besides its tuning knobs.
pub struct Options<F: CachedFn> {
    pub config: CacheConfig,
    pub storage: Arc<dyn Storage>,
    pub codec: Arc<dyn Codec<F::Value>>,
    pub function: F,
    /// When set, counters are exported to this sink every few seconds.
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

pub(crate) struct CacheInner<F: CachedFn> {
    pub(crate) config: CacheConfig,
    pub(crate) function: F,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec<F::Value>>,
    limiter: Limiter,
    pub(crate) stats: Arc<Stats>,
}

/// Releases the gate slot on drop, so that a panicking computation
/// cannot leak occupancy.
struct SlotGuard<'a> {
    limiter: &'a Limiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release(1);
    }
}

impl<F: CachedFn> CacheInner<F> {
    /// Runs the computation through the concurrency gate.
    ///
    /// Returns `Ok(None)` when the gate rejects the attempt; callers on
    /// the foreground path turn that into [`Error::FnRunLimited`], the
    /// worker drops the event.
    pub(crate) async fn run_fn(
        &self,
        ctx: &CallContext,
        args: &F::Args,
    ) -> Result<Option<FnResult<F::Value>>, Error> {
        self.stats.incr(Metric::FnRun);

        let (_, admitted) = self.limiter.acquire(1);
        // A rejected acquire has still incremented the occupancy; the
        // guard pairs the release on every path.
        let _slot = SlotGuard {
            limiter: &self.limiter,
        };

        if !admitted {
            self.stats.incr(Metric::FnRunLimited);
            return Ok(None);
        }

        let result = self.function.run(ctx, args).await;
        self.stats
            .gauge(GaugeMetric::FnRunConcurrency, i64::from(self.limiter.current()));

        match result {
            Ok(record) => Ok(Some(record)),
            Err(err) => Err(Error::Computation(err)),
        }
    }

    /// Encodes `value`, wraps it in a freshly stamped envelope and writes
    /// it through storage.
    pub(crate) async fn write_envelope(&self, key: &str, value: &F::Value) -> Result<(), Error> {
        let payload = self.codec.encode(value)?;
        let envelope = CachedValue::new(payload);
        let bytes = envelope.to_bytes()?;

        self.storage.set(key, bytes, None).await?;
        Ok(())
    }

    fn decode(&self, envelope: &CachedValue) -> Result<F::Value, Error> {
        Ok(self.codec.decode(&envelope.bytes)?)
    }
}

/// High-availability function-result cache.
///
/// Cheap to clone; clones share the storage, the gate, the event queue
/// and the worker.
pub struct HaCache<F: CachedFn> {
    inner: Arc<CacheInner<F>>,
    events_tx: Option<mpsc::Sender<Event<F>>>,
}

impl<F: CachedFn> Clone for HaCache<F> {
    fn clone(&self) -> Self {
        HaCache {
            inner: Arc::clone(&self.inner),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<F: CachedFn> std::fmt::Debug for HaCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaCache")
            .field("config", &self.inner.config)
            .field("queue_enabled", &self.events_tx.is_some())
            .finish_non_exhaustive()
    }
}

impl<F: CachedFn> HaCache<F> {
    /// Builds the engine and spawns its worker (and, when a metrics sink
    /// is configured, the stats reporter).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: Options<F>) -> Self {
        let Options {
            config,
            storage,
            codec,
            function,
            metrics,
        } = options;

        let stats = Arc::new(Stats::default());
        let queue_capacity = usize::try_from(config.event_buffer_size).ok().filter(|capacity| *capacity > 0);

        let inner = Arc::new(CacheInner {
            limiter: Limiter::new(config.fn_run_limit),
            config,
            function,
            storage,
            codec,
            stats: Arc::clone(&stats),
        });

        let events_tx = queue_capacity.map(|capacity| {
            let (tx, rx) = mpsc::channel(capacity);
            tokio::spawn(events::run(Arc::clone(&inner), rx));
            tx
        });

        if let Some(sink) = metrics {
            spawn_reporter(&stats, sink);
        }

        HaCache { inner, events_tx }
    }

    /// Serves `args` from the cache, computing and scheduling refreshes
    /// as needed.
    pub async fn fetch(&self, args: F::Args) -> Result<F::Value, Error> {
        let ctx = CallContext::new();
        let stats = &self.inner.stats;

        let key = self.inner.function.cache_key(&args);
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        if key == SKIP_CACHE {
            stats.incr(Metric::Skip);
            let record = self.run_foreground(&ctx, &args).await?;
            return Ok(record.value);
        }

        let envelope = match self.inner.storage.get(&key).await {
            Ok(bytes) => match CachedValue::from_bytes(&bytes) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    // Unusable stored bytes: recompute and overwrite.
                    tracing::warn!(key = %key, error = %err, "discarding undecodable cache envelope");
                    None
                }
            },
            Err(StorageError::Miss) => {
                stats.incr(Metric::Miss);
                None
            }
            Err(err) => {
                stats.incr(Metric::StorageErr);
                tracing::warn!(key = %key, error = %err, "storage read failed, treating as miss");
                None
            }
        };

        let Some(envelope) = envelope else {
            // Nothing usable stored: compute in the foreground, return
            // the result and fill the entry asynchronously.
            let record = match self.run_foreground(&ctx, &args).await {
                Ok(record) => record,
                Err(err) => {
                    stats.incr(Metric::FnRunErr);
                    return Err(err);
                }
            };

            if !record.ignore && ctx.should_cache() {
                self.trigger(Event::Fill {
                    key,
                    value: record.value.clone(),
                });
            }
            return Ok(record.value);
        };

        let now = unix_timestamp();
        let config = &self.inner.config;
        match envelope.classify(now, config.expiration, config.max_acceptable_expiration) {
            Freshness::Fresh => {
                stats.incr(Metric::Hit);
                self.inner.decode(&envelope)
            }
            Freshness::Stale => {
                stats.incr(Metric::MissExpired);
                // Serve the stored value; a decode failure aborts the
                // refresh and surfaces instead.
                let value = self.inner.decode(&envelope)?;
                self.trigger(Event::Refresh { args });
                Ok(value)
            }
            Freshness::Invalid => {
                stats.incr(Metric::MissInvalid);
                match self.run_foreground(&ctx, &args).await {
                    Ok(record) => {
                        if !record.ignore && ctx.should_cache() {
                            self.trigger(Event::Fill {
                                key,
                                value: record.value.clone(),
                            });
                        }
                        Ok(record.value)
                    }
                    Err(_) => {
                        // Gate rejection or computation failure: serve
                        // the outdated entry rather than an error.
                        stats.incr(Metric::InvalidReturned);
                        self.inner.decode(&envelope)
                    }
                }
            }
        }
    }

    async fn run_foreground(
        &self,
        ctx: &CallContext,
        args: &F::Args,
    ) -> Result<FnResult<F::Value>, Error> {
        match self.inner.run_fn(ctx, args).await? {
            Some(record) => Ok(record),
            None => Err(Error::FnRunLimited),
        }
    }

    /// Reads the raw stored envelope for `key`.
    pub async fn get(&self, key: &str) -> Result<CachedValue, Error> {
        let bytes = self.inner.storage.get(key).await?;
        Ok(CachedValue::from_bytes(&bytes)?)
    }

    /// Encodes `value` and writes it under `key` with a fresh timestamp.
    pub async fn set(&self, key: &str, value: &F::Value) -> Result<(), Error> {
        self.inner.write_envelope(key, value).await
    }

    /// Enqueues a deferred write without blocking.
    ///
    /// When the queue is full (or disabled), the event is dropped and the
    /// drop is counted; the next read of the affected entry will schedule
    /// it again.
    pub fn trigger(&self, event: Event<F>) {
        let Some(tx) = &self.events_tx else {
            self.inner.stats.incr(Metric::EventChanBlocked);
            return;
        };

        if tx.try_send(event).is_err() {
            self.inner.stats.incr(Metric::EventChanBlocked);
        }
    }

    /// The engine's counters.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.inner.stats
    }

    /// Current occupancy of the computation gate.
    pub fn fn_run_concurrency(&self) -> i32 {
        self.inner.limiter.current()
    }
}
