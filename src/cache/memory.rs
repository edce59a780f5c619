use super::{CacheBackend, GlobPattern};
use crate::clock::{Clock, SystemClock};
use crate::error::GuardError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Epoch millis after which the entry is gone
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Single-process backend: a mutex-protected map with lazy TTL expiry.
///
/// Every operation takes the lock for its whole read-modify-write, which
/// makes `incr` atomic within the process.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the store.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, GuardError> {
        self.entries
            .lock()
            .map_err(|_| GuardError::Internal("Failed to acquire cache lock".to_string()))
    }

    fn ensure_connected(&self) -> Result<(), GuardError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GuardError::StoreUnavailable("memory backend disconnected".to_string()))
        }
    }

    /// Increment under one lock. A missing or expired key restarts at zero
    /// with `deadline`; a live key without expiry also picks it up.
    fn increment(&self, key: &str, deadline: Option<u64>) -> Result<i64, GuardError> {
        self.ensure_connected()?;
        let now = self.clock.now_millis();
        let mut entries = self.lock()?;

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if !entry.is_live(now) {
                    entry.value = "0".to_string();
                    entry.expires_at = deadline;
                } else if entry.expires_at.is_none() {
                    entry.expires_at = deadline;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: deadline,
            });

        let current: i64 = entry.value.parse().map_err(|_| {
            GuardError::Store(format!("Value at '{}' is not an integer", key))
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    fn deadline(&self, ttl_seconds: u64) -> Option<u64> {
        (ttl_seconds > 0).then(|| self.clock.now_millis() + ttl_seconds * 1000)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GuardError> {
        self.ensure_connected()?;
        let now = self.clock.now_millis();
        let mut entries = self.lock()?;

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), GuardError> {
        self.ensure_connected()?;
        let entry = Entry {
            value: value.to_string(),
            expires_at: self.deadline(ttl_seconds),
        };
        self.lock()?.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GuardError> {
        self.ensure_connected()?;
        self.lock()?.remove(key);
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, GuardError> {
        self.ensure_connected()?;
        let glob = GlobPattern::new(pattern)?;
        let now = self.clock.now_millis();
        let mut entries = self.lock()?;

        let before = entries.len();
        let mut removed = 0u64;
        entries.retain(|key, entry| {
            if !entry.is_live(now) {
                return false;
            }
            if glob.matches(key) {
                removed += 1;
                return false;
            }
            true
        });

        tracing::debug!(pattern = %pattern, removed, swept = before - entries.len(), "Pattern delete");
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, GuardError> {
        self.increment(key, None)
    }

    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, GuardError> {
        self.increment(key, self.deadline(ttl_seconds))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), GuardError> {
        self.ensure_connected()?;
        let deadline = self.deadline(ttl_seconds);
        if let Some(entry) = self.lock()?.get_mut(key) {
            entry.expires_at = deadline;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, GuardError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ping(&self) -> Result<(), GuardError> {
        self.ensure_connected()
    }
}
