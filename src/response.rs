use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::circuit_breaker::CircuitStats;
use crate::metrics::ScopeMetrics;
use crate::rate_limiter::{RateLimitResult, Reputation};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_time: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitResponse {
    pub fn from_result(result: &RateLimitResult, now_secs: u64) -> Self {
        Self {
            allowed: result.allowed,
            remaining: result.remaining,
            limit: result.limit,
            reset_time: result.reset_time,
            retry_after: (!result.allowed).then(|| result.retry_after(now_secs)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CircuitResponse {
    pub name: String,
    #[serde(flatten)]
    pub stats: CircuitStats,
}

impl CircuitResponse {
    pub fn new(name: impl Into<String>, stats: CircuitStats) -> Self {
        Self {
            name: name.into(),
            stats,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitListResponse {
    pub circuits: BTreeMap<String, CircuitStats>,
    pub open_circuits: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationResponse {
    pub ip: String,
    pub reputation: Option<Reputation>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub rate_limiter: RateLimiterMetrics,
    pub circuits: BTreeMap<String, CircuitStats>,
    pub cache: CacheMetrics,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterMetrics {
    pub totals: ScopeMetrics,
    pub scopes: HashMap<String, ScopeMetrics>,
}

#[derive(Debug, Serialize)]
pub struct CacheMetrics {
    pub backend: String,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: String,
    pub message: String,
}

impl ActionResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}
