//! End-to-end setup: Redis storage, statsd metrics, a slow computation.
//!
//! Requires a Redis server on localhost:6379; statsd on localhost:8125 is
//! optional (metrics are skipped when the socket cannot be set up).

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use hacache::{
    BincodeCodec, CacheConfig, CachedFn, CallContext, FnResult, HaCache, MetricsSink, Options,
    StatsdSink,
};
use hacache_redis::RedisStorage;

struct LongTask;

impl CachedFn for LongTask {
    type Args = (String, u32);
    type Value = String;

    // Keyed by name only: the age of the first call sticks.
    fn cache_key(&self, (name, _age): &(String, u32)) -> String {
        format!("long-task:{name}")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        (name, age): &'a (String, u32),
    ) -> BoxFuture<'a, anyhow::Result<FnResult<String>>> {
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(FnResult::new(format!("{name} is {age} years old")))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hacache::logging::init_pretty("info");

    let storage = RedisStorage::connect("redis://127.0.0.1:6379").await?;
    let metrics = StatsdSink::new("hacache", "127.0.0.1:8125")
        .ok()
        .map(|sink| Arc::new(sink) as Arc<dyn MetricsSink>);

    let cache = HaCache::new(Options {
        config: CacheConfig {
            expiration: Duration::from_secs(3600),
            max_acceptable_expiration: Duration::from_secs(600),
            fn_run_limit: 10,
            event_buffer_size: 100,
        },
        storage: Arc::new(storage),
        codec: Arc::new(BincodeCodec::new()),
        function: LongTask,
        metrics,
    });

    let tom = cache.fetch(("tom".to_owned(), 10)).await?;
    println!("{tom}");

    // Give the deferred fill a moment, then hit the cache: same key, so
    // tom stays ten years old.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tom_again = cache.fetch(("tom".to_owned(), 20)).await?;
    println!("{tom_again}");

    Ok(())
}
