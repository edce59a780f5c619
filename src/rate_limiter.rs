//! Fixed-window rate limiting on top of the shared [`CacheStore`].
//!
//! Windows are aligned to wall-clock boundaries: a 60 second window always
//! starts at a multiple of 60 seconds since the epoch. Counters live in the
//! cache store under `rate_limit:<scope>:<subject>:<window_start>` and expire
//! at the end of their window. Rejected requests still increment the counter.

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::key_generator::{canonical_ip, rate_limit_key, reputation_key};
use crate::metrics::{Decision, LimiterMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// `requests` allowed per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowLimit {
    pub requests: u64,
    pub window_seconds: u64,
}

impl WindowLimit {
    pub fn new(requests: u64, window_seconds: u64) -> Self {
        Self {
            requests,
            window_seconds,
        }
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Admit the request as if no limit applied
    FailOpen,
    /// Reject the request
    #[default]
    FailClosed,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch seconds at which the current window ends
    pub reset_time: u64,
    pub limit: u64,
}

impl RateLimitResult {
    /// Result for a check that imposes no limit.
    pub fn unlimited(reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_time,
            limit: u64::MAX,
        }
    }

    /// Seconds a rejected caller should wait, never less than one.
    pub fn retry_after(&self, now_secs: u64) -> u64 {
        self.reset_time.saturating_sub(now_secs).max(1)
    }
}

/// Reputation label attached to an IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reputation {
    Good,
    Suspicious,
    Bad,
}

impl Reputation {
    /// Factor applied to the base limit.
    pub fn multiplier(self) -> f64 {
        match self {
            Reputation::Good => 1.5,
            Reputation::Suspicious => 0.5,
            Reputation::Bad => 0.1,
        }
    }
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reputation::Good => write!(f, "good"),
            Reputation::Suspicious => write!(f, "suspicious"),
            Reputation::Bad => write!(f, "bad"),
        }
    }
}

impl FromStr for Reputation {
    type Err = crate::error::GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(Reputation::Good),
            "suspicious" => Ok(Reputation::Suspicious),
            "bad" => Ok(Reputation::Bad),
            other => Err(crate::error::GuardError::Validation(format!(
                "Unknown reputation '{}', expected good, suspicious or bad",
                other
            ))),
        }
    }
}

/// Subscription tier of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl fmt::Display for UserTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserTier::Free => write!(f, "free"),
            UserTier::Basic => write!(f, "basic"),
            UserTier::Premium => write!(f, "premium"),
            UserTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl FromStr for UserTier {
    type Err = crate::error::GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(UserTier::Free),
            "basic" => Ok(UserTier::Basic),
            "premium" => Ok(UserTier::Premium),
            "enterprise" => Ok(UserTier::Enterprise),
            other => Err(crate::error::GuardError::Validation(format!(
                "Unknown user tier '{}'",
                other
            ))),
        }
    }
}

/// Identity of the caller being limited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub ip: String,
    pub tier: Option<UserTier>,
    pub path: String,
}

impl RequestContext {
    pub fn for_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    pub fn for_user(user_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ip: ip.into(),
            ..Self::default()
        }
    }

    pub fn with_tier(mut self, tier: UserTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// User id when known, otherwise the IP.
    pub fn subject(&self) -> String {
        match &self.user_id {
            Some(user_id) => format!("user:{}", user_id),
            None => format!("ip:{}", canonical_ip(&self.ip)),
        }
    }
}

/// A rate-limit rule that can be checked against a request.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult;
}

/// Shared entry point: owns the store, clock and failure policy, and builds
/// the concrete limiters.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: CacheStore,
    clock: Arc<dyn Clock>,
    policy: StoreFailurePolicy,
    reputation_ttl_seconds: u64,
    metrics: LimiterMetrics,
}

impl RateLimiter {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            policy: StoreFailurePolicy::default(),
            reputation_ttl_seconds: 3600,
            metrics: LimiterMetrics::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reputation_ttl(mut self, ttl_seconds: u64) -> Self {
        self.reputation_ttl_seconds = ttl_seconds.max(1);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> StoreFailurePolicy {
        self.policy
    }

    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    pub fn reputation_ttl(&self) -> u64 {
        self.reputation_ttl_seconds
    }

    /// Count one request for `subject` in the current window of `limit`.
    pub async fn check_window(&self, scope: &str, subject: &str, limit: WindowLimit) -> RateLimitResult {
        let window = limit.window_seconds.max(1);
        let now = self.clock.now_secs();
        let window_start = now / window * window;
        let reset_time = window_start + window;
        let key = rate_limit_key(scope, subject, window_start);

        let count = self.store.incr_with_ttl(&key, reset_time - now).await;
        if count <= 0 {
            return self.on_store_failure(scope, subject, limit, reset_time).await;
        }

        let count = count as u64;
        let allowed = count <= limit.requests;
        let result = RateLimitResult {
            allowed,
            remaining: limit.requests.saturating_sub(count),
            reset_time,
            limit: limit.requests,
        };

        if !allowed {
            debug!(
                scope = %scope,
                subject = %subject,
                count,
                limit = limit.requests,
                reset_time,
                "Rate limit exceeded"
            );
        }
        let decision = if allowed { Decision::Allowed } else { Decision::Throttled };
        self.metrics.record(scope, decision, false).await;

        result
    }

    /// Clear `subject`'s counter for the current window.
    pub async fn reset(&self, scope: &str, subject: &str, window_seconds: u64) {
        let window = window_seconds.max(1);
        let window_start = self.clock.now_secs() / window * window;
        self.store
            .del(&rate_limit_key(scope, subject, window_start))
            .await;
    }

    pub fn per_user_limit(&self, scope: impl Into<String>, limit: WindowLimit) -> PerUserLimit {
        PerUserLimit {
            limiter: self.clone(),
            scope: scope.into(),
            limit,
        }
    }

    pub fn per_ip_adaptive(&self, scope: impl Into<String>, limit: WindowLimit) -> AdaptiveIpLimit {
        AdaptiveIpLimit {
            limiter: self.clone(),
            scope: scope.into(),
            limit,
        }
    }

    pub fn burst_control(&self, max_burst: u64, refill_window_seconds: u64) -> BurstControl {
        BurstControl {
            limiter: self.clone(),
            limit: WindowLimit::new(max_burst, refill_window_seconds),
        }
    }

    /// Record a reputation for `ip`; it lapses after the configured TTL unless renewed.
    pub async fn update_ip_reputation(&self, ip: &str, reputation: Reputation) {
        self.store
            .set_json(&reputation_key(ip), &reputation, self.reputation_ttl_seconds)
            .await;
        debug!(ip = %ip, reputation = %reputation, "Updated IP reputation");
    }

    pub async fn ip_reputation(&self, ip: &str) -> Option<Reputation> {
        self.store.get_json(&reputation_key(ip)).await
    }

    async fn on_store_failure(
        &self,
        scope: &str,
        subject: &str,
        limit: WindowLimit,
        reset_time: u64,
    ) -> RateLimitResult {
        let allowed = self.policy == StoreFailurePolicy::FailOpen;
        warn!(
            scope = %scope,
            subject = %subject,
            policy = ?self.policy,
            "Rate limit store unavailable"
        );

        let decision = if allowed { Decision::Allowed } else { Decision::Throttled };
        self.metrics.record(scope, decision, true).await;

        RateLimitResult {
            allowed,
            remaining: if allowed { limit.requests } else { 0 },
            reset_time,
            limit: limit.requests,
        }
    }
}

/// Fixed window per user; anonymous callers are counted by IP.
#[derive(Debug, Clone)]
pub struct PerUserLimit {
    limiter: RateLimiter,
    scope: String,
    limit: WindowLimit,
}

impl PerUserLimit {
    pub fn limit(&self) -> WindowLimit {
        self.limit
    }
}

#[async_trait]
impl Limiter for PerUserLimit {
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        self.limiter
            .check_window(&self.scope, &ctx.subject(), self.limit)
            .await
    }
}

/// Fixed window per IP whose limit scales with the IP's reputation.
#[derive(Debug, Clone)]
pub struct AdaptiveIpLimit {
    limiter: RateLimiter,
    scope: String,
    limit: WindowLimit,
}

impl AdaptiveIpLimit {
    /// Limit that applies to an IP with `reputation`.
    pub fn effective_limit(&self, reputation: Option<Reputation>) -> WindowLimit {
        let factor = reputation.map_or(1.0, Reputation::multiplier);
        let requests = ((self.limit.requests as f64) * factor).floor().max(1.0) as u64;
        WindowLimit::new(requests, self.limit.window_seconds)
    }
}

#[async_trait]
impl Limiter for AdaptiveIpLimit {
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        let reputation = self.limiter.ip_reputation(&ctx.ip).await;
        let limit = self.effective_limit(reputation);
        self.limiter
            .check_window(&self.scope, &format!("ip:{}", canonical_ip(&ctx.ip)), limit)
            .await
    }
}

/// Short, tight window meant to sit in front of a steady-state limiter.
#[derive(Debug, Clone)]
pub struct BurstControl {
    limiter: RateLimiter,
    limit: WindowLimit,
}

#[async_trait]
impl Limiter for BurstControl {
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        self.limiter
            .check_window("burst", &ctx.subject(), self.limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::clock::MockClock;
    use std::time::Duration;

    /// 30 seconds into a 60 second window starting at 1_700_000_040.
    const START_MILLIS: u64 = 1_700_000_070_000;

    fn limiter() -> (RateLimiter, Arc<MemoryBackend>, MockClock) {
        let clock = MockClock::new(START_MILLIS);
        let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
        let limiter =
            RateLimiter::new(CacheStore::new(backend.clone())).with_clock(Arc::new(clock.clone()));
        (limiter, backend, clock)
    }

    #[tokio::test]
    async fn test_window_boundary() {
        let (limiter, _, _) = limiter();
        let limit = WindowLimit::new(10, 60);

        let mut previous = u64::MAX;
        for _ in 0..10 {
            let result = limiter.check_window("api", "user:1", limit).await;
            assert!(result.allowed);
            assert!(result.remaining < previous);
            assert_eq!(result.reset_time, 1_700_000_100);
            previous = result.remaining;
        }
        assert_eq!(previous, 0);

        let rejected = limiter.check_window("api", "user:1", limit).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after(1_700_000_070), 30);
    }

    #[tokio::test]
    async fn test_rejected_attempts_still_count() {
        let (limiter, backend, _) = limiter();
        let limit = WindowLimit::new(1, 60);
        for _ in 0..3 {
            limiter.check_window("api", "user:1", limit).await;
        }

        use crate::cache::CacheBackend;
        let raw = backend
            .get(&rate_limit_key("api", "user:1", 1_700_000_040))
            .await
            .unwrap();
        assert_eq!(raw.as_deref(), Some("3"));

        let api = limiter.metrics().scope("api").await.unwrap();
        assert_eq!(api.allowed_requests, 1);
        assert_eq!(api.throttled_requests, 2);
    }

    #[tokio::test]
    async fn test_new_window_resets_count() {
        let (limiter, _, clock) = limiter();
        let limit = WindowLimit::new(2, 60);

        limiter.check_window("api", "user:1", limit).await;
        limiter.check_window("api", "user:1", limit).await;
        assert!(!limiter.check_window("api", "user:1", limit).await.allowed);

        clock.advance(Duration::from_secs(30));
        let result = limiter.check_window("api", "user:1", limit).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.reset_time, 1_700_000_160);
    }

    #[tokio::test]
    async fn test_counter_expires_at_window_end() {
        let (limiter, backend, clock) = limiter();
        limiter.check_window("api", "user:1", WindowLimit::new(5, 60)).await;
        assert_eq!(backend.len(), 1);

        clock.advance(Duration::from_secs(30));
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let (limiter, _, _) = limiter();
        let limit = WindowLimit::new(1, 60);
        assert!(limiter.check_window("api", "user:1", limit).await.allowed);
        assert!(limiter.check_window("api", "user:2", limit).await.allowed);
        assert!(limiter.check_window("export", "user:1", limit).await.allowed);
        assert!(!limiter.check_window("api", "user:1", limit).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_unavailable() {
        let (limiter, backend, _) = limiter();
        backend.set_connected(false);

        let result = limiter.check_window("api", "user:1", WindowLimit::new(10, 60)).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);

        let api = limiter.metrics().scope("api").await.unwrap();
        assert_eq!(api.store_unavailable, 1);
    }

    #[tokio::test]
    async fn test_fail_open_when_configured() {
        let (limiter, backend, _) = limiter();
        let limiter = limiter.with_policy(StoreFailurePolicy::FailOpen);
        backend.set_connected(false);

        let result = limiter.check_window("api", "user:1", WindowLimit::new(10, 60)).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 10);
    }

    #[tokio::test]
    async fn test_per_user_limit_falls_back_to_ip() {
        let (limiter, _, _) = limiter();
        let per_user = limiter.per_user_limit("api", WindowLimit::new(1, 60));

        let alice = RequestContext::for_user("alice", "198.51.100.1");
        let anonymous = RequestContext::for_ip("198.51.100.1");

        assert!(per_user.check(&alice).await.allowed);
        assert!(!per_user.check(&alice).await.allowed);
        // Same IP, different subject
        assert!(per_user.check(&anonymous).await.allowed);
        assert!(!per_user.check(&anonymous).await.allowed);
    }

    #[tokio::test]
    async fn test_adaptive_limit_follows_reputation() {
        let (limiter, _, _) = limiter();
        let adaptive = limiter.per_ip_adaptive("ip", WindowLimit::new(10, 60));

        limiter.update_ip_reputation("203.0.113.9", Reputation::Bad).await;
        let bad = RequestContext::for_ip("203.0.113.9");
        let first = adaptive.check(&bad).await;
        assert!(first.allowed);
        assert_eq!(first.limit, 1);
        assert!(!adaptive.check(&bad).await.allowed);

        limiter.update_ip_reputation("203.0.113.10", Reputation::Good).await;
        let good = adaptive.check(&RequestContext::for_ip("203.0.113.10")).await;
        assert_eq!(good.limit, 15);

        let unknown = adaptive.check(&RequestContext::for_ip("203.0.113.11")).await;
        assert_eq!(unknown.limit, 10);

        assert_eq!(adaptive.effective_limit(Some(Reputation::Suspicious)).requests, 5);
    }

    #[tokio::test]
    async fn test_reputation_matches_equivalent_ip_spellings() {
        let (limiter, _, _) = limiter();
        let adaptive = limiter.per_ip_adaptive("ip", WindowLimit::new(10, 60));

        limiter.update_ip_reputation("2001:db8::1", Reputation::Bad).await;
        assert_eq!(limiter.ip_reputation("2001:DB8::1").await, Some(Reputation::Bad));

        let upper = RequestContext::for_ip("2001:DB8::1");
        assert_eq!(adaptive.check(&upper).await.limit, 1);
        // Same address, same counter
        let expanded = RequestContext::for_ip("2001:0db8:0:0:0:0:0:1");
        assert!(!adaptive.check(&expanded).await.allowed);

        limiter.update_ip_reputation("203.0.113.9", Reputation::Suspicious).await;
        let mapped = RequestContext::for_ip("::ffff:203.0.113.9");
        assert_eq!(adaptive.check(&mapped).await.limit, 5);
    }

    #[tokio::test]
    async fn test_reputation_decays() {
        let (limiter, _, clock) = limiter();
        let limiter = limiter.with_reputation_ttl(600);

        limiter.update_ip_reputation("192.0.2.1", Reputation::Suspicious).await;
        assert_eq!(limiter.ip_reputation("192.0.2.1").await, Some(Reputation::Suspicious));

        clock.advance(Duration::from_secs(600));
        assert_eq!(limiter.ip_reputation("192.0.2.1").await, None);
    }

    #[tokio::test]
    async fn test_burst_control_uses_short_window() {
        let (limiter, _, clock) = limiter();
        let burst = limiter.burst_control(3, 1);
        let ctx = RequestContext::for_user("bob", "192.0.2.7");

        for _ in 0..3 {
            assert!(burst.check(&ctx).await.allowed);
        }
        assert!(!burst.check(&ctx).await.allowed);

        clock.advance(Duration::from_secs(1));
        assert!(burst.check(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_current_window() {
        let (limiter, _, _) = limiter();
        let limit = WindowLimit::new(1, 60);
        limiter.check_window("api", "user:1", limit).await;
        assert!(!limiter.check_window("api", "user:1", limit).await.allowed);

        limiter.reset("api", "user:1", 60).await;
        assert!(limiter.check_window("api", "user:1", limit).await.allowed);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!("Bad".parse::<Reputation>().unwrap(), Reputation::Bad);
        assert!("evil".parse::<Reputation>().is_err());
        assert_eq!("premium".parse::<UserTier>().unwrap(), UserTier::Premium);
    }

    #[test]
    fn test_result_serialization() {
        let result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_time: 1_700_000_100,
            limit: 10,
        };
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["resetTime"], 1_700_000_100u64);
        assert_eq!(json["allowed"], false);
    }
}
