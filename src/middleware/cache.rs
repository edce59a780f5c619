use crate::cache::CacheStore;
use crate::key_generator::cache_key;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};

/// Cache-aside wrapper around arbitrary async operations.
///
/// Compose with a breaker by passing the breaker call as the operation:
///
/// ```no_run
/// # use bulwark::cache::CacheStore;
/// # use bulwark::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
/// # use bulwark::middleware::CacheAside;
/// # async fn example() {
/// let cache = CacheAside::new(CacheStore::in_memory());
/// let breaker = CircuitBreaker::new("ledger-db", CircuitBreakerConfig::default());
///
/// let balance = cache
///     .cache_response("balance:user:42", &("EUR",), 60, || {
///         breaker.execute(|| async { Ok::<i64, std::io::Error>(1250) })
///     })
///     .await;
/// # let _ = balance;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CacheAside {
    store: CacheStore,
}

impl CacheAside {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Return the cached result for `(operation, args)` or run `op` and cache
    /// its `Ok` value for `ttl_seconds`. Errors are returned untouched and
    /// never cached. A store outage only means every call is a miss.
    pub async fn cache_response<A, T, E, F, Fut>(
        &self,
        operation: &str,
        args: &A,
        ttl_seconds: u64,
        op: F,
    ) -> Result<T, E>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = match cache_key(operation, args) {
            Ok(key) => key,
            Err(e) => {
                warn!(operation = %operation, error = %e, "Arguments not serializable, bypassing cache");
                return op().await;
            }
        };

        if let Some(hit) = self.store.get_json::<T>(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        debug!(key = %key, "Cache miss");
        let value = op().await?;
        self.store.set_json(&key, &value, ttl_seconds).await;
        Ok(value)
    }

    /// Drop the cached result for one argument set.
    pub async fn evict<A: Serialize + ?Sized>(&self, operation: &str, args: &A) {
        if let Ok(key) = cache_key(operation, args) {
            self.store.del(&key).await;
        }
    }
}
