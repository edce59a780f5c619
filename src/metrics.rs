use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Decision counts for one limiter scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    /// Decisions taken by the store-failure policy rather than a counter
    pub store_unavailable: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Throttled,
}

#[derive(Debug, Clone, Default)]
pub struct LimiterMetrics {
    scopes: Arc<RwLock<HashMap<String, ScopeMetrics>>>,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, scope: &str, decision: Decision, store_unavailable: bool) {
        let mut scopes = self.scopes.write().await;
        let metrics = scopes.entry(scope.to_string()).or_default();

        metrics.total_requests += 1;
        match decision {
            Decision::Allowed => metrics.allowed_requests += 1,
            Decision::Throttled => metrics.throttled_requests += 1,
        }
        if store_unavailable {
            metrics.store_unavailable += 1;
        }
    }

    pub async fn scope(&self, scope: &str) -> Option<ScopeMetrics> {
        self.scopes.read().await.get(scope).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, ScopeMetrics> {
        self.scopes.read().await.clone()
    }

    pub async fn totals(&self) -> ScopeMetrics {
        let scopes = self.scopes.read().await;
        let mut totals = ScopeMetrics::default();

        for metrics in scopes.values() {
            totals.total_requests += metrics.total_requests;
            totals.allowed_requests += metrics.allowed_requests;
            totals.throttled_requests += metrics.throttled_requests;
            totals.store_unavailable += metrics.store_unavailable;
        }

        totals
    }

    pub async fn reset(&self) {
        self.scopes.write().await.clear();
    }
}
