use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::cache::CacheStore;
use crate::registry::CircuitBreakerRegistry;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub cache: ServiceStatus,
    pub circuits: CircuitSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub backend: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitSummary {
    pub total: usize,
    pub open: Vec<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Debug, Clone)]
pub struct HealthChecker {
    cache: CacheStore,
    registry: Arc<CircuitBreakerRegistry>,
}

impl HealthChecker {
    pub fn new(cache: CacheStore, registry: Arc<CircuitBreakerRegistry>) -> Self {
        // Pin the uptime origin to service construction
        let _ = *START_TIME;
        Self { cache, registry }
    }

    /// The service stays up without its cache or with circuits open; both
    /// only downgrade the status to "degraded".
    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let cache_status = self.check_cache().await;
        let open = self.registry.open_circuits();

        let overall_status = if cache_status.status == "healthy" && open.is_empty() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus {
                cache: cache_status,
                circuits: CircuitSummary {
                    total: self.registry.len(),
                    open,
                },
            },
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.cache.ping().await.is_ok()
    }

    async fn check_cache(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.cache.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                backend: self.cache.backend_name().to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable".to_string(),
                backend: self.cache.backend_name().to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}
