//! Quickstart against the in-process memory storage.
//!
//! Run with `cargo run --example memory`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use hacache::{
    BincodeCodec, CacheConfig, CachedFn, CallContext, FnResult, HaCache, MemoryStorage, Options,
};

struct SlowSquare;

impl CachedFn for SlowSquare {
    type Args = u64;
    type Value = u64;

    fn cache_key(&self, args: &u64) -> String {
        format!("square:{args}")
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a CallContext,
        args: &'a u64,
    ) -> BoxFuture<'a, anyhow::Result<FnResult<u64>>> {
        async move {
            // Stand-in for the expensive part.
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(FnResult::new(args * args))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() {
    hacache::logging::init_pretty("info");

    let cache = HaCache::new(Options {
        config: CacheConfig::default(),
        storage: Arc::new(MemoryStorage::new()),
        codec: Arc::new(BincodeCodec::new()),
        function: SlowSquare,
        metrics: None,
    });

    let started = Instant::now();
    let first = cache.fetch(7).await.unwrap();
    println!("first fetch:  {first} ({:?})", started.elapsed());

    // Let the deferred fill land before reading again.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let second = cache.fetch(7).await.unwrap();
    println!("second fetch: {second} ({:?})", started.elapsed());
}
