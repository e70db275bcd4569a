//! Memoization combinators
//!
//! [`cached`] and [`cached_async`] wrap a fallible function so repeated calls
//! with equivalent arguments are answered from a [`McpToolsCache`]. Only
//! `Ok` results that are not failure payloads are stored; on a hit the
//! wrapped function does not run at all.
//!
//! Concurrent misses on the same key all run the function unless the
//! wrapper opts into single-flight, in which case later callers wait for
//! the first one and re-check the cache.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::McpToolsCache;
use crate::entry::DataClass;
use crate::keys::function_key;

type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Per-wrapper caching options
pub struct CachedOptions<A> {
    ttl: Option<u64>,
    data_class: Option<DataClass>,
    key_fn: Option<KeyFn<A>>,
    single_flight: bool,
}

impl<A> CachedOptions<A> {
    pub fn new() -> Self {
        Self {
            ttl: None,
            data_class: None,
            key_fn: None,
            single_flight: false,
        }
    }

    /// Explicit TTL in seconds, overriding the data class default
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn data_class(mut self, data_class: DataClass) -> Self {
        self.data_class = Some(data_class);
        self
    }

    /// Replace argument hashing with a custom key function
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Coalesce concurrent misses on the same key (async wrappers only)
    pub fn single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    /// Key for one call, or `None` when the arguments cannot be serialized
    fn key_for(&self, function_id: &str, args: &A) -> Option<String>
    where
        A: Serialize,
    {
        if let Some(key_fn) = &self.key_fn {
            return Some(key_fn(args));
        }
        match serde_json::to_value(args) {
            Ok(value) => Some(function_key(function_id, &value)),
            Err(e) => {
                warn!("Calling {} uncached, arguments do not serialize: {}", function_id, e);
                None
            }
        }
    }
}

impl<A> Default for CachedOptions<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for CachedOptions<A> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            data_class: self.data_class,
            key_fn: self.key_fn.clone(),
            single_flight: self.single_flight,
        }
    }
}

/// Wrap a synchronous function with caching.
///
/// `function_id` should be unique per wrapped function; it prefixes every
/// derived key.
pub fn cached<A, R, E, F>(
    cache: Arc<McpToolsCache>,
    function_id: impl Into<String>,
    options: CachedOptions<A>,
    func: F,
) -> impl Fn(A) -> Result<R, E>
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: Fn(A) -> Result<R, E>,
{
    let function_id = function_id.into();
    move |args: A| {
        let Some(key) = options.key_for(&function_id, &args) else {
            return func(args);
        };

        if let Some(hit) = cache.get_as::<R>(&key, options.data_class) {
            return Ok(hit);
        }

        let result = func(args)?;
        if !cache.set_serialized(&key, &result, options.ttl, options.data_class) {
            debug!("Result of {} was not cached", function_id);
        }
        Ok(result)
    }
}

/// Wrap an async function with caching.
///
/// The returned closure yields boxed `'static` futures, so it can be stored
/// and called from spawned tasks.
pub fn cached_async<A, R, E, F, Fut>(
    cache: Arc<McpToolsCache>,
    function_id: impl Into<String>,
    options: CachedOptions<A>,
    func: F,
) -> impl Fn(A) -> BoxFuture<'static, Result<R, E>> + Send + Sync
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    E: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let function_id: Arc<str> = Arc::from(function_id.into());
    let options = Arc::new(options);
    let func = Arc::new(func);
    let flights = Arc::new(InFlight::default());

    move |args: A| {
        let cache = Arc::clone(&cache);
        let function_id = Arc::clone(&function_id);
        let options = Arc::clone(&options);
        let func = Arc::clone(&func);
        let flights = Arc::clone(&flights);

        async move {
            let Some(key) = options.key_for(&function_id, &args) else {
                return func(args).await;
            };

            if let Some(hit) = cache.get_as_async::<R>(&key, options.data_class).await {
                return Ok(hit);
            }

            let _flight = if options.single_flight {
                let flight = InFlight::acquire(&flights, &key).await;
                if let Some(value) = cache.get_untracked_async(&key, options.data_class).await {
                    if let Some(hit) = cache.decode::<R>(&key, value) {
                        debug!("Coalesced concurrent miss: {}", key);
                        return Ok(hit);
                    }
                }
                Some(flight)
            } else {
                None
            };

            let result = func(args).await?;
            let stored = match serde_json::to_value(&result) {
                Ok(value) => cache.set_async(&key, value, options.ttl, options.data_class).await,
                Err(e) => {
                    warn!("Result of {} does not serialize: {}", function_id, e);
                    false
                }
            };
            if !stored {
                debug!("Result of {} was not cached", function_id);
            }
            Ok(result)
        }
        .boxed()
    }
}

/// Per-key async locks for single-flight wrappers
#[derive(Default)]
struct InFlight {
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InFlight {
    async fn acquire(registry: &Arc<Self>, key: &str) -> Flight {
        let lock = {
            let mut locks = registry.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        Flight {
            registry: Arc::clone(registry),
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held while computing a value; releases the key on drop, including when
/// the computing future is cancelled.
struct Flight {
    registry: Arc<InFlight>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut locks = self.registry.locks.lock();
        // Registry and this guard are the only holders when nobody waits.
        if Arc::strong_count(OwnedMutexGuard::mutex(&guard)) <= 2 {
            locks.remove(&self.key);
        }
        drop(guard);
    }
}
