//! End-to-end engine behavior against the in-process storage.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use hacache::{
    BincodeCodec, CacheConfig, CachedFn, CallContext, Codec, CodecError, Error, Event, FnResult,
    HaCache, MemoryStorage, Metric, Options, Storage, StorageError, SKIP_CACHE,
};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Foo {
    bar: String,
    cached: bool,
}

/// Delegates to bincode but stamps `cached` on the way out, so tests can
/// tell a decoded entry from a freshly computed one.
struct MarkerCodec;

impl Codec<Foo> for MarkerCodec {
    fn encode(&self, value: &Foo) -> Result<Vec<u8>, CodecError> {
        BincodeCodec::new().encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Foo, CodecError> {
        let mut foo: Foo = BincodeCodec::new().decode(bytes)?;
        foo.cached = true;
        Ok(foo)
    }

    fn fresh_zero(&self) -> Foo {
        Foo::default()
    }
}

struct FooFn;

impl CachedFn for FooFn {
    type Args = String;
    type Value = Foo;

    fn cache_key(&self, args: &String) -> String {
        format!("{args}:foo")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<Foo>>> {
        async move {
            Ok(FnResult::new(Foo {
                bar: args.clone(),
                cached: false,
            }))
        }
        .boxed()
    }
}

#[tokio::test]
async fn basic_fill_then_decoded_hit() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: storage.clone(),
        codec: Arc::new(MarkerCodec),
        function: FooFn,
        metrics: None,
    });

    let first = cache.fetch("jack".to_owned()).await.unwrap();
    assert_eq!(
        first,
        Foo {
            bar: "jack".to_owned(),
            cached: false,
        }
    );

    // Give the worker a moment to perform the deferred fill.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.len(), 1);

    let second = cache.fetch("jack".to_owned()).await.unwrap();
    assert_eq!(
        second,
        Foo {
            bar: "jack".to_owned(),
            cached: true,
        }
    );

    assert_eq!(cache.stats().get(Metric::Miss), 1);
    assert_eq!(cache.stats().get(Metric::Hit), 1);
}

#[tokio::test]
async fn direct_set_feeds_the_read_path() {
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(MarkerCodec),
        function: FooFn,
        metrics: None,
    });

    let planted = Foo {
        bar: "planted".to_owned(),
        cached: false,
    };
    cache.set("jack:foo", &planted).await.unwrap();

    let envelope = cache.get("jack:foo").await.unwrap();
    assert!((now_unix() - envelope.create_ts) <= 1);

    let served = cache.fetch("jack".to_owned()).await.unwrap();
    assert_eq!(served.bar, "planted");
    assert!(served.cached);
    assert_eq!(cache.stats().get(Metric::Hit), 1);
}

struct RandFn;

impl CachedFn for RandFn {
    type Args = String;
    type Value = u64;

    fn cache_key(&self, _args: &String) -> String {
        SKIP_CACHE.to_owned()
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u64>>> {
        async move { Ok(FnResult::new(rand::random())) }.boxed()
    }
}

#[tokio::test]
async fn skip_cache_sentinel_bypasses_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: storage.clone(),
        codec: Arc::new(BincodeCodec::new()),
        function: RandFn,
        metrics: None,
    });

    let first = cache.fetch("skip".to_owned()).await.unwrap();
    let second = cache.fetch("skip".to_owned()).await.unwrap();
    let third = cache.fetch("skip".to_owned()).await.unwrap();

    assert_ne!(first, second);
    assert_ne!(second, third);
    assert_ne!(first, third);

    sleep(Duration::from_millis(50)).await;
    assert!(storage.is_empty());
    assert_eq!(cache.stats().get(Metric::Skip), 3);
    assert_eq!(cache.stats().get(Metric::Miss), 0);
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Stamped {
    value: String,
    create_ts: i64,
}

struct StampFn;

impl CachedFn for StampFn {
    type Args = String;
    type Value = Stamped;

    fn cache_key(&self, args: &String) -> String {
        format!("{args}:stamped")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<Stamped>>> {
        async move {
            Ok(FnResult::new(Stamped {
                value: args.clone(),
                create_ts: now_unix(),
            }))
        }
        .boxed()
    }
}

fn short_lived_config() -> CacheConfig {
    CacheConfig {
        expiration: Duration::from_secs(1),
        max_acceptable_expiration: Duration::from_secs(3),
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn stale_entry_is_served_then_refreshed_in_background() {
    let cache = HaCache::new(Options {
        config: short_lived_config(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: StampFn,
        metrics: None,
    });

    cache.fetch("aa".to_owned()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // Past `expiration` but within the acceptable grace: the old entry
    // is served and a refresh is scheduled.
    sleep(Duration::from_secs(2)).await;
    let stale = cache.fetch("aa".to_owned()).await.unwrap();
    assert!(now_unix() - stale.create_ts >= 1);
    assert_eq!(cache.stats().get(Metric::MissExpired), 1);

    // The scheduled refresh replaces the envelope shortly after.
    sleep(Duration::from_millis(200)).await;
    let envelope = cache.get("aa:stamped").await.unwrap();
    assert!(now_unix() - envelope.create_ts <= 1);
}

#[tokio::test]
async fn invalid_entry_forces_synchronous_refresh() {
    let cache = HaCache::new(Options {
        config: short_lived_config(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: StampFn,
        metrics: None,
    });

    cache.fetch("bb".to_owned()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // Sleep past expiration plus the whole grace window.
    sleep(Duration::from_millis(5200)).await;
    let value = cache.fetch("bb".to_owned()).await.unwrap();
    assert!(now_unix() - value.create_ts <= 1);
    assert_eq!(cache.stats().get(Metric::MissInvalid), 1);
    assert_eq!(cache.stats().get(Metric::InvalidReturned), 0);
}

struct FailAfterFirstFn {
    calls: Arc<AtomicU64>,
}

impl CachedFn for FailAfterFirstFn {
    type Args = String;
    type Value = Stamped;

    fn cache_key(&self, args: &String) -> String {
        format!("{args}:flaky")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<Stamped>>> {
        async move {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("upstream unavailable");
            }
            Ok(FnResult::new(Stamped {
                value: args.clone(),
                create_ts: now_unix(),
            }))
        }
        .boxed()
    }
}

#[tokio::test]
async fn failing_refresh_serves_the_invalid_entry() {
    let cache = HaCache::new(Options {
        config: short_lived_config(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: FailAfterFirstFn {
            calls: Arc::new(AtomicU64::new(0)),
        },
        metrics: None,
    });

    let original = cache.fetch("cc".to_owned()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    sleep(Duration::from_millis(5200)).await;
    // The recompute fails, so the invalid entry comes back regardless.
    let served = cache.fetch("cc".to_owned()).await.unwrap();
    assert_eq!(served.create_ts, original.create_ts);
    assert_eq!(cache.stats().get(Metric::InvalidReturned), 1);
    assert_eq!(cache.stats().get(Metric::MissInvalid), 1);
}

struct SlowFn {
    running: Arc<AtomicI32>,
    peak: Arc<AtomicI32>,
}

impl CachedFn for SlowFn {
    type Args = u32;
    type Value = u32;

    fn cache_key(&self, args: &u32) -> String {
        format!("slow:{args}")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a u32,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u32>>> {
        async move {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_secs(1)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(FnResult::new(*args))
        }
        .boxed()
    }
}

#[tokio::test]
async fn gate_limits_concurrent_misses() {
    let peak = Arc::new(AtomicI32::new(0));
    let cache = HaCache::new(Options {
        config: CacheConfig {
            fn_run_limit: 2,
            ..CacheConfig::default()
        },
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: SlowFn {
            running: Arc::new(AtomicI32::new(0)),
            peak: peak.clone(),
        },
        metrics: None,
    });

    // Five concurrent misses on five distinct keys; the gate admits two.
    let results = futures::future::join_all((0..5u32).map(|i| cache.fetch(i))).await;

    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    let limited = results
        .iter()
        .filter(|result| matches!(result, Err(Error::FnRunLimited)))
        .count();
    assert_eq!(succeeded, 2);
    assert_eq!(limited, 3);

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(cache.fn_run_concurrency(), 0);
    assert_eq!(cache.stats().get(Metric::FnRunLimited), 3);
    // Rejected foreground misses also count as failed runs.
    assert_eq!(cache.stats().get(Metric::FnRunErr), 3);
}

struct CtxVetoFn {
    counter: Arc<AtomicU64>,
}

impl CachedFn for CtxVetoFn {
    type Args = ();
    type Value = u64;

    fn cache_key(&self, _args: &()) -> String {
        "ctx-veto".to_owned()
    }

    fn run<'a>(
        &'a self,
        ctx: &'a CallContext,
        _args: &'a (),
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u64>>> {
        async move {
            ctx.ignore_result();
            Ok(FnResult::new(self.counter.fetch_add(1, Ordering::SeqCst)))
        }
        .boxed()
    }
}

#[tokio::test]
async fn context_veto_keeps_storage_empty() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: storage.clone(),
        codec: Arc::new(BincodeCodec::new()),
        function: CtxVetoFn {
            counter: Arc::new(AtomicU64::new(0)),
        },
        metrics: None,
    });

    let first = cache.fetch(()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let second = cache.fetch(()).await.unwrap();

    assert_ne!(first, second);
    assert!(storage.is_empty());
}

struct RecordVetoFn {
    counter: Arc<AtomicU64>,
}

impl CachedFn for RecordVetoFn {
    type Args = ();
    type Value = u64;

    fn cache_key(&self, _args: &()) -> String {
        "record-veto".to_owned()
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _args: &'a (),
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u64>>> {
        async move {
            Ok(FnResult::uncached(
                self.counter.fetch_add(1, Ordering::SeqCst),
            ))
        }
        .boxed()
    }
}

#[tokio::test]
async fn record_veto_keeps_storage_empty() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: storage.clone(),
        codec: Arc::new(BincodeCodec::new()),
        function: RecordVetoFn {
            counter: Arc::new(AtomicU64::new(0)),
        },
        metrics: None,
    });

    let first = cache.fetch(()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let second = cache.fetch(()).await.unwrap();

    assert_ne!(first, second);
    assert!(storage.is_empty());
}

struct CountFn {
    counter: Arc<AtomicU64>,
}

impl CachedFn for CountFn {
    type Args = ();
    type Value = u64;

    fn cache_key(&self, _args: &()) -> String {
        "count".to_owned()
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _args: &'a (),
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u64>>> {
        async move { Ok(FnResult::new(self.counter.fetch_add(1, Ordering::SeqCst))) }.boxed()
    }
}

#[tokio::test]
async fn unvetoed_results_are_cached() {
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: CountFn {
            counter: Arc::new(AtomicU64::new(0)),
        },
        metrics: None,
    });

    let first = cache.fetch(()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let second = cache.fetch(()).await.unwrap();

    assert_eq!(first, second);
}

struct PanicFn;

impl CachedFn for PanicFn {
    type Args = String;
    type Value = String;

    fn cache_key(&self, args: &String) -> String {
        format!("{args}:panic")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<String>>> {
        async move { panic!("boom") }.boxed()
    }
}

#[tokio::test]
async fn worker_survives_a_panicking_refresh() {
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: PanicFn,
        metrics: None,
    });

    cache.trigger(Event::Refresh {
        args: "x".to_owned(),
    });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.stats().get(Metric::WorkerPanic), 1);

    // The worker is still draining the queue afterwards.
    cache.trigger(Event::Fill {
        key: "k".to_owned(),
        value: "v".to_owned(),
    });
    sleep(Duration::from_millis(50)).await;
    assert!(cache.get("k").await.is_ok());
}

struct BrokenStorage;

impl Storage for BrokenStorage {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async { Err(StorageError::Backend("connection refused".to_owned())) })
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async { Err(StorageError::Backend("connection refused".to_owned())) })
    }
}

#[tokio::test]
async fn storage_fault_degrades_into_a_recompute() {
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(BrokenStorage),
        codec: Arc::new(MarkerCodec),
        function: FooFn,
        metrics: None,
    });

    let value = cache.fetch("jack".to_owned()).await.unwrap();
    assert_eq!(value.bar, "jack");
    assert!(!value.cached);

    assert_eq!(cache.stats().get(Metric::StorageErr), 1);
    // A backend fault is not a miss.
    assert_eq!(cache.stats().get(Metric::Miss), 0);
}

struct EmptyKeyFn;

impl CachedFn for EmptyKeyFn {
    type Args = String;
    type Value = String;

    fn cache_key(&self, _args: &String) -> String {
        String::new()
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a String,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<String>>> {
        async move { Ok(FnResult::new(args.clone())) }.boxed()
    }
}

#[tokio::test]
async fn empty_key_fails_without_side_effects() {
    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: EmptyKeyFn,
        metrics: None,
    });

    let err = cache.fetch("whatever".to_owned()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidKey));
    assert_eq!(cache.stats().get(Metric::FnRun), 0);
}

#[tokio::test]
async fn disabled_queue_drops_every_fill() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = HaCache::new(Options {
        config: CacheConfig {
            event_buffer_size: -1,
            ..CacheConfig::default()
        },
        storage: storage.clone(),
        codec: Arc::new(MarkerCodec),
        function: FooFn,
        metrics: None,
    });

    let value = cache.fetch("jack".to_owned()).await.unwrap();
    assert_eq!(value.bar, "jack");

    sleep(Duration::from_millis(50)).await;
    assert!(storage.is_empty());
    assert_eq!(cache.stats().get(Metric::EventChanBlocked), 1);
}

#[tokio::test]
async fn full_queue_drops_the_overflow() {
    let cache = HaCache::new(Options {
        config: CacheConfig {
            event_buffer_size: 1,
            ..CacheConfig::default()
        },
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: CountFn {
            counter: Arc::new(AtomicU64::new(0)),
        },
        metrics: None,
    });

    // No await between the triggers, so the worker cannot drain yet: the
    // first event occupies the only slot, the rest are counted drops.
    for _ in 0..3 {
        cache.trigger(Event::Fill {
            key: "k".to_owned(),
            value: 1,
        });
    }

    assert_eq!(cache.stats().get(Metric::EventChanBlocked), 2);
}
