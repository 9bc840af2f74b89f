//! Per-invocation context handed to the wrapped computation.

use std::sync::atomic::{AtomicBool, Ordering};

/// Control surface for one cache invocation.
///
/// The engine creates one context per call and passes a reference to the
/// computation. The computation may call [`ignore_result`](Self::ignore_result)
/// to declare that its (successful) result must not be cached; the engine
/// inspects the flag after the computation returns. This is the in-band
/// twin of [`FnResult::uncached`](crate::FnResult::uncached), useful when
/// the decision is made deep inside the computation.
#[derive(Debug)]
pub struct CallContext {
    cache_result: AtomicBool,
}

impl CallContext {
    pub fn new() -> Self {
        CallContext {
            cache_result: AtomicBool::new(true),
        }
    }

    /// Declares that the result of this invocation must not be cached.
    pub fn ignore_result(&self) {
        self.cache_result.store(false, Ordering::Release);
    }

    /// Whether the result may be cached. Defaults to `true`.
    pub fn should_cache(&self) -> bool {
        self.cache_result.load(Ordering::Acquire)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
