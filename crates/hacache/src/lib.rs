//! # hacache
//!
//! A high-availability function-result cache: wraps an expensive async
//! computation behind a byte-keyed key-value store and keeps serving
//! acceptably-stale data when the computation is slow or failing, so
//! user-visible latency stays flat.
//!
//! ## Entry lifecycle
//!
//! Every stored entry carries its creation timestamp and is classified
//! on read against two thresholds:
//!
//! - within `expiration` the entry is **fresh** and served as-is;
//! - for a further `max_acceptable_expiration` it is **stale**: still
//!   served, but a background refresh is scheduled on a bounded queue;
//! - beyond that it is **invalid**: the computation runs synchronously,
//!   and only if that fails is the outdated entry served as a last
//!   resort.
//!
//! Concurrent fan-out into the computation is bounded per process by a
//! counted gate ([`Limiter`]); there is no per-key deduplication and no
//! cross-process coordination. A computation can veto caching of its own
//! result, either structurally ([`FnResult::uncached`]) or from deep
//! inside via the per-call [`CallContext`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use futures::future::BoxFuture;
//! use futures::FutureExt;
//! use hacache::{
//!     BincodeCodec, CacheConfig, CachedFn, CallContext, FnResult, HaCache, MemoryStorage,
//!     Options,
//! };
//!
//! struct Greeter;
//!
//! impl CachedFn for Greeter {
//!     type Args = String;
//!     type Value = String;
//!
//!     fn cache_key(&self, args: &String) -> String {
//!         format!("greet:{args}")
//!     }
//!
//!     fn run<'a>(
//!         &'a self,
//!         _ctx: &'a CallContext,
//!         args: &'a String,
//!     ) -> BoxFuture<'a, anyhow::Result<FnResult<String>>> {
//!         async move { Ok(FnResult::new(format!("hello {args}"))) }.boxed()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = HaCache::new(Options {
//!     config: CacheConfig::default(),
//!     storage: Arc::new(MemoryStorage::new()),
//!     codec: Arc::new(BincodeCodec::new()),
//!     function: Greeter,
//!     metrics: None,
//! });
//!
//! assert_eq!(cache.fetch("jack".to_owned()).await.unwrap(), "hello jack");
//! # }
//! ```
//!
//! ## Metrics
//!
//! Each engine keeps atomic counters (`hit`, `miss`, `miss-expired`,
//! `miss-invalid`, `invalid-returned`, `fn-run`, `fn-run-err`,
//! `fn-run-limited`, `event-chan-blocked`, `skip`, `worker-panic`,
//! `storage-err`) and a `fn-run-concurrency` gauge. Configure a
//! [`MetricsSink`] (e.g. [`StatsdSink`]) and the deltas are exported
//! every few seconds.

pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod events;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod storage;

pub use cache::{CachedFn, FnResult, HaCache, Options, SKIP_CACHE};
pub use codec::{BincodeCodec, Codec, CodecError, JsonCodec};
pub use config::CacheConfig;
pub use context::CallContext;
pub use envelope::{CachedValue, Freshness};
pub use error::Error;
pub use events::Event;
pub use limiter::Limiter;
pub use metrics::{GaugeMetric, Metric, MetricsSink, Stats, StatsdSink};
pub use storage::{MemoryStorage, Storage, StorageError};
