use super::CacheBackend;
use crate::error::GuardError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const SCAN_BATCH: usize = 200;

/// Schedule for connection attempts while no connection exists.
#[derive(Debug)]
struct Reconnect {
    next_attempt: Option<Instant>,
    backoff: Duration,
}

/// Shared store backend on Redis.
///
/// Creating the backend never touches the network; [`RedisBackend::connect`]
/// establishes a `ConnectionManager` (which reconnects on its own afterwards).
/// Until a connection exists every call first tries to establish one, with
/// exponential backoff between failed attempts, and fails with
/// [`GuardError::StoreUnavailable`] so the [`super::CacheStore`] façade
/// degrades. Redis being down at startup is therefore not permanent.
pub struct RedisBackend {
    client: Client,
    connection: RwLock<Option<ConnectionManager>>,
    reconnect: Mutex<Reconnect>,
    connect_timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    connect_attempts: AtomicU64,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connected", &self.is_connected())
            .field("connect_timeout", &self.connect_timeout)
            .field("connect_attempts", &self.connect_attempts())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> Result<Self, GuardError> {
        let client = Client::open(redis_url).map_err(|e| {
            GuardError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        let retry_initial = Duration::from_millis(500);
        Ok(Self {
            client,
            connection: RwLock::new(None),
            reconnect: Mutex::new(Reconnect {
                next_attempt: None,
                backoff: retry_initial,
            }),
            connect_timeout: Duration::from_secs(2),
            retry_initial,
            retry_max: Duration::from_secs(30),
            connect_attempts: AtomicU64::new(0),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay after the first failed attempt, doubling up to `max`.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self.reconnect.get_mut().backoff = initial;
        self
    }

    /// Connection attempts made so far, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Try to connect. On failure the backend stays disconnected and the
    /// error is returned for the caller to log.
    pub async fn connect(&self) -> Result<(), GuardError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let manager = time::timeout(self.connect_timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| GuardError::StoreUnavailable("Timed out connecting to Redis".to_string()))?
            .map_err(|e| GuardError::StoreUnavailable(format!("Failed to connect to Redis: {}", e)))?;

        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(manager);
        info!("Connected to Redis");
        Ok(())
    }

    /// Connect, logging instead of failing when Redis is unreachable. Later
    /// calls keep retrying on the backoff schedule.
    pub async fn connect_or_degrade(self) -> Self {
        if let Err(e) = self.connect().await {
            warn!(error = %e, "Redis unavailable, cache store running degraded");
            self.schedule_retry(&mut *self.reconnect.lock().await);
        }
        self
    }

    fn current(&self) -> Option<ConnectionManager> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn schedule_retry(&self, state: &mut Reconnect) {
        state.next_attempt = Some(Instant::now() + state.backoff);
        state.backoff = (state.backoff * 2).min(self.retry_max);
    }

    /// The live connection, or one attempt to establish it when the backoff
    /// allows. Only one caller attempts at a time; the rest fail fast.
    async fn connection(&self) -> Result<ConnectionManager, GuardError> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let unavailable =
            || GuardError::StoreUnavailable("No Redis connection available".to_string());
        let mut state = self.reconnect.try_lock().map_err(|_| unavailable())?;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        if state.next_attempt.map_or(false, |at| Instant::now() < at) {
            return Err(unavailable());
        }

        debug!(attempt = self.connect_attempts() + 1, "Reconnecting to Redis");
        match self.connect().await {
            Ok(()) => {
                state.next_attempt = None;
                state.backoff = self.retry_initial;
                self.current().ok_or_else(unavailable)
            }
            Err(e) => {
                let retry_in = state.backoff;
                self.schedule_retry(&mut state);
                warn!(
                    error = %e,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Redis reconnect failed"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_connected(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GuardError> {
        let mut conn = self.connection().await?;
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), GuardError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_seconds > 0 {
            cmd.arg("EX").arg(ttl_seconds);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GuardError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, GuardError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, u64>(&mut conn)
                    .await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, GuardError> {
        let mut conn = self.connection().await?;
        let value = redis::cmd("INCR")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(value)
    }

    /// `SET key 0 EX ttl NX` + `INCR` in one `MULTI`, so the counter and its
    /// TTL are created together. `INCR` keeps an existing TTL.
    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, GuardError> {
        let mut conn = self.connection().await?;
        let (value,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async::<_, (i64,)>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), GuardError> {
        let mut conn = self.connection().await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, GuardError> {
        let mut conn = self.connection().await?;
        let count = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn ping(&self) -> Result<(), GuardError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}
