//! The deferred-write queue and its consumer.
//!
//! The engine never writes to storage on the caller's critical path;
//! every store goes through an [`Event`] on a bounded queue drained by a
//! single worker task per engine. Producers never block: when the queue
//! is full the event is dropped and counted, and the entry will simply be
//! re-classified (and re-enqueued) on the next read.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::cache::{CacheInner, CachedFn};
use crate::context::CallContext;
use crate::metrics::Metric;

/// A deferred write scheduled by the engine.
pub enum Event<F: CachedFn> {
    /// Re-run the computation with `args` and store the fresh result.
    Refresh { args: F::Args },
    /// Store an already-computed value under `key`.
    Fill { key: String, value: F::Value },
}

impl<F: CachedFn> std::fmt::Debug for Event<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Refresh { .. } => f.debug_struct("Refresh").finish_non_exhaustive(),
            Event::Fill { key, .. } => f
                .debug_struct("Fill")
                .field("key", key)
                .finish_non_exhaustive(),
        }
    }
}

/// The worker loop. Runs until the owning engine is dropped and the
/// channel closes.
///
/// Each event is dequeued before it is dispatched, and dispatch runs
/// inside `catch_unwind`: a panicking computation or codec costs exactly
/// the one event that triggered it, the loop keeps consuming.
pub(crate) async fn run<F: CachedFn>(
    inner: Arc<CacheInner<F>>,
    mut events: mpsc::Receiver<Event<F>>,
) {
    while let Some(event) = events.recv().await {
        let dispatch = handle_event(&inner, event);
        if let Err(panic) = AssertUnwindSafe(dispatch).catch_unwind().await {
            inner.stats.incr(Metric::WorkerPanic);
            tracing::error!(
                panic = panic_message(&*panic),
                "cache worker recovered from a panic"
            );
        }
    }

    tracing::debug!("cache worker terminated");
}

async fn handle_event<F: CachedFn>(inner: &CacheInner<F>, event: Event<F>) {
    match event {
        Event::Refresh { args } => {
            let ctx = CallContext::new();
            let record = match inner.run_fn(&ctx, &args).await {
                Ok(Some(record)) => record,
                // The gate is contended; drop the refresh, the next read
                // of the entry re-enqueues it.
                Ok(None) => return,
                Err(err) => {
                    inner.stats.incr(Metric::FnRunErr);
                    tracing::warn!(error = %err, "background refresh failed");
                    return;
                }
            };

            if record.ignore || !ctx.should_cache() {
                return;
            }

            let key = inner.function.cache_key(&args);
            if let Err(err) = inner.write_envelope(&key, &record.value).await {
                tracing::warn!(key = %key, error = %err, "failed to store refreshed value");
            }
        }
        Event::Fill { key, value } => {
            if let Err(err) = inner.write_envelope(&key, &value).await {
                tracing::warn!(key = %key, error = %err, "failed to fill cache entry");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
