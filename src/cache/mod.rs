//! Key/value cache store with a degraded mode.
//!
//! [`CacheBackend`] is the fallible storage contract implemented by
//! [`MemoryBackend`] and [`RedisBackend`]. [`CacheStore`] wraps a backend and
//! never surfaces its failures: when the backend is disconnected or a call
//! fails, reads return nothing, writes become no-ops and `incr` returns `0`.

pub mod glob;
pub mod memory;
pub mod redis;

pub use self::glob::GlobPattern;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::GuardError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage operations the cache layer needs from a backing store.
///
/// `incr` must be atomic at the store level: rate-limit counters are
/// incremented concurrently from many processes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name used in logs and health output.
    fn name(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>, GuardError>;

    /// Store `value`; `ttl_seconds == 0` stores without expiry.
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), GuardError>;

    async fn del(&self, key: &str) -> Result<(), GuardError>;

    /// Delete every key matching the glob, returning how many were removed.
    async fn del_pattern(&self, pattern: &str) -> Result<u64, GuardError>;

    /// Increment the integer at `key` (missing keys count as 0) and return the new value.
    async fn incr(&self, key: &str) -> Result<i64, GuardError>;

    /// Like `incr`, but a key created by this call expires after
    /// `ttl_seconds`. Creation and expiry are one store operation, so a
    /// counter is never left without a TTL.
    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, GuardError>;

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), GuardError>;

    async fn exists(&self, key: &str) -> Result<bool, GuardError>;

    async fn ping(&self) -> Result<(), GuardError>;
}

/// Degrading façade over a [`CacheBackend`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            breaker: None,
        }
    }

    /// In-process store using the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Route every backend call through `breaker`, so an unhealthy store is
    /// skipped without waiting on it.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Round-trip check against the backend. Unlike the data operations this
    /// reports the failure, for health endpoints.
    pub async fn ping(&self) -> Result<(), GuardError> {
        self.backend.ping().await
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.guarded("get", key, |backend| async move { backend.get(key).await })
            .await
            .flatten()
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: u64) {
        self.guarded("set", key, |backend| async move {
            backend.set(key, value, ttl_seconds).await
        })
        .await;
    }

    pub async fn del(&self, key: &str) {
        self.guarded("del", key, |backend| async move { backend.del(key).await })
            .await;
    }

    /// Returns the number of keys removed, `0` when degraded.
    pub async fn del_pattern(&self, pattern: &str) -> u64 {
        self.guarded("del_pattern", pattern, |backend| async move {
            backend.del_pattern(pattern).await
        })
        .await
        .unwrap_or(0)
    }

    /// Returns the incremented value, or `0` when the store is unavailable.
    /// A live store never returns `0` here, so callers can tell the two apart.
    pub async fn incr(&self, key: &str) -> i64 {
        self.guarded("incr", key, |backend| async move { backend.incr(key).await })
            .await
            .unwrap_or(0)
    }

    /// Counter increment that sets the TTL when the key is created. Returns
    /// `0` when the store is unavailable.
    pub async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> i64 {
        self.guarded("incr_with_ttl", key, |backend| async move {
            backend.incr_with_ttl(key, ttl_seconds).await
        })
        .await
        .unwrap_or(0)
    }

    pub async fn expire(&self, key: &str, ttl_seconds: u64) {
        self.guarded("expire", key, |backend| async move {
            backend.expire(key, ttl_seconds).await
        })
        .await;
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.guarded("exists", key, |backend| async move { backend.exists(key).await })
            .await
            .unwrap_or(false)
    }

    /// Read and deserialize a JSON value. Undecodable payloads count as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl_seconds).await,
            Err(e) => warn!(key = %key, error = %e, "Skipping cache write, value not serializable"),
        }
    }

    async fn guarded<'a, T, F, Fut>(&'a self, operation: &'static str, key: &str, call: F) -> Option<T>
    where
        F: FnOnce(&'a dyn CacheBackend) -> Fut,
        Fut: Future<Output = Result<T, GuardError>>,
    {
        let backend = self.backend.as_ref();
        let result = match &self.breaker {
            Some(breaker) => breaker
                .execute(|| call(backend))
                .await
                .map_err(|e| e.into_guard_error(|inner| inner)),
            None => call(backend).await,
        };

        match result {
            Ok(value) => Some(value),
            Err(GuardError::CircuitOpen(_)) => None,
            // Backends that are reconnecting report this on every call
            Err(e @ GuardError::StoreUnavailable(_)) => {
                debug!(
                    backend = self.backend.name(),
                    operation,
                    key = %key,
                    error = %e,
                    "Cache store unavailable, degrading"
                );
                None
            }
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    operation,
                    key = %key,
                    error = %e,
                    "Cache store call failed, degrading"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::clock::MockClock;
    use serde::Deserialize;
    use std::time::Duration;

    fn memory_store() -> (CacheStore, Arc<MemoryBackend>, MockClock) {
        let clock = MockClock::new(1_700_000_000_000);
        let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
        (CacheStore::new(backend.clone()), backend, clock)
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let (store, _, _) = memory_store();

        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);

        store.set("k", "v", 60).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.exists("k").await);

        store.del("k").await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_degraded_mode_never_fails() {
        let (store, backend, _) = memory_store();
        store.set("present", "1", 0).await;
        backend.set_connected(false);

        assert_eq!(store.get("present").await, None);
        store.set("k", "v", 60).await;
        store.del("present").await;
        assert_eq!(store.del_pattern("*").await, 0);
        assert_eq!(store.incr("counter").await, 0);
        assert!(!store.exists("present").await);
        assert!(store.ping().await.is_err());

        // Writes during the outage were dropped, earlier data survived.
        backend.set_connected(true);
        assert_eq!(store.get("k").await, None);
        assert_eq!(store.get("present").await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Balance {
            cents: i64,
            currency: String,
        }

        let (store, _, _) = memory_store();
        let balance = Balance {
            cents: 1250,
            currency: "EUR".to_string(),
        };
        store.set_json("balance:user:1", &balance, 30).await;
        assert_eq!(store.get_json::<Balance>("balance:user:1").await, Some(balance));

        store.set("balance:user:2", "not json", 30).await;
        assert_eq!(store.get_json::<Balance>("balance:user:2").await, None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_through_store() {
        let (store, _, clock) = memory_store();
        store.set("session", "abc", 10).await;

        clock.advance(Duration::from_secs(9));
        assert!(store.exists("session").await);

        clock.advance(Duration::from_secs(1));
        assert!(!store.exists("session").await);
    }

    #[derive(Debug)]
    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn del(&self, _key: &str) -> Result<(), GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn del_pattern(&self, _pattern: &str) -> Result<u64, GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn incr(&self, _key: &str) -> Result<i64, GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn incr_with_ttl(&self, _key: &str, _ttl: u64) -> Result<i64, GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn expire(&self, _key: &str, _ttl: u64) -> Result<(), GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn exists(&self, _key: &str) -> Result<bool, GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
        async fn ping(&self) -> Result<(), GuardError> {
            Err(GuardError::StoreUnavailable("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_errors_degrade() {
        let store = CacheStore::new(Arc::new(FailingBackend));
        assert_eq!(store.get("k").await, None);
        assert_eq!(store.incr("k").await, 0);
        assert!(!store.exists("k").await);
        store.set("k", "v", 1).await;
    }

    #[tokio::test]
    async fn test_breaker_trips_on_failing_backend() {
        let clock = MockClock::new(0);
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "cache-store",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            Arc::new(clock),
        ));
        let store = CacheStore::new(Arc::new(FailingBackend)).with_breaker(breaker.clone());

        store.get("a").await;
        store.get("b").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open breaker: calls are skipped and not counted.
        assert_eq!(store.incr("c").await, 0);
        assert_eq!(breaker.stats().failures, 2);
    }
}
