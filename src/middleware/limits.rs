use crate::error::GuardError;
use crate::rate_limiter::{
    Limiter, RateLimitResult, RateLimiter, RequestContext, UserTier, WindowLimit,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Check `subject` against `limit` requests per `window_seconds`.
pub async fn check_rate_limit(
    limiter: &RateLimiter,
    subject: &str,
    limit: u64,
    window_seconds: u64,
) -> RateLimitResult {
    limiter
        .check_window("check", subject, WindowLimit::new(limit, window_seconds))
        .await
}

/// Chain limiters; the first rejection wins and later limiters are not consulted.
pub fn combine(limiters: Vec<Arc<dyn Limiter>>) -> CombinedLimit {
    CombinedLimit { limiters }
}

/// Pick the per-user limit from the caller's tier.
pub fn by_user_tier(limiter: &RateLimiter, limits: TierLimits) -> TieredLimit {
    TieredLimit {
        limiter: limiter.clone(),
        limits,
    }
}

pub struct CombinedLimit {
    limiters: Vec<Arc<dyn Limiter>>,
}

impl CombinedLimit {
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[async_trait]
impl Limiter for CombinedLimit {
    /// When every limiter admits the request, the result with the fewest
    /// remaining requests is returned.
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        let mut tightest: Option<RateLimitResult> = None;

        for limiter in &self.limiters {
            let result = limiter.check(ctx).await;
            if !result.allowed {
                return result;
            }
            tightest = match tightest {
                Some(current) if current.remaining <= result.remaining => Some(current),
                _ => Some(result),
            };
        }

        tightest.unwrap_or_else(|| RateLimitResult::unlimited(0))
    }
}

/// Requests per window for one tier. The window is written as a
/// human-readable duration (`"1m"`, `"30s"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub requests: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl TierLimit {
    pub fn new(requests: u64, window: Duration) -> Self {
        Self { requests, window }
    }

    pub fn window_limit(&self) -> WindowLimit {
        WindowLimit::new(self.requests, self.window.as_secs().max(1))
    }
}

/// Tier → limit table.
#[derive(Debug, Clone, PartialEq)]
pub struct TierLimits {
    limits: HashMap<UserTier, TierLimit>,
    fallback: TierLimit,
}

impl TierLimits {
    pub fn new(fallback: TierLimit) -> Self {
        Self {
            limits: HashMap::new(),
            fallback,
        }
    }

    pub fn with_tier(mut self, tier: UserTier, limit: TierLimit) -> Self {
        self.limits.insert(tier, limit);
        self
    }

    /// Parse `{"free": {"requests": 100, "window": "1m"}, ...}`.
    pub fn from_json(raw: &str, fallback: TierLimit) -> Result<Self, GuardError> {
        let limits: HashMap<UserTier, TierLimit> = serde_json::from_str(raw)
            .map_err(|e| GuardError::Configuration(format!("Invalid tier limits: {}", e)))?;
        Ok(Self { limits, fallback })
    }

    /// The tier's own entry, else the free tier's, else the fallback.
    pub fn limit_for(&self, tier: UserTier) -> TierLimit {
        self.limits
            .get(&tier)
            .or_else(|| self.limits.get(&UserTier::Free))
            .copied()
            .unwrap_or(self.fallback)
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self::new(TierLimit::new(60, minute))
            .with_tier(UserTier::Free, TierLimit::new(100, minute))
            .with_tier(UserTier::Basic, TierLimit::new(500, minute))
            .with_tier(UserTier::Premium, TierLimit::new(2_000, minute))
            .with_tier(UserTier::Enterprise, TierLimit::new(10_000, minute))
    }
}

#[derive(Debug, Clone)]
pub struct TieredLimit {
    limiter: RateLimiter,
    limits: TierLimits,
}

#[async_trait]
impl Limiter for TieredLimit {
    async fn check(&self, ctx: &RequestContext) -> RateLimitResult {
        let tier = ctx.tier.unwrap_or_default();
        let limit = self.limits.limit_for(tier).window_limit();
        self.limiter
            .per_user_limit("tier", limit)
            .check(ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryBackend};
    use crate::clock::MockClock;
    use crate::rate_limiter::Reputation;

    fn limiter() -> RateLimiter {
        let clock = Arc::new(MockClock::new(1_700_000_040_000));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        RateLimiter::new(CacheStore::new(backend)).with_clock(clock)
    }

    #[tokio::test]
    async fn test_check_rate_limit_boundary() {
        let limiter = limiter();
        for expected in (0..10).rev() {
            let result = check_rate_limit(&limiter, "203.0.113.5", 10, 60).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }
        let result = check_rate_limit(&limiter, "203.0.113.5", 10, 60).await;
        assert!(!result.allowed);
        assert_eq!(result.reset_time, 1_700_000_100);
    }

    #[tokio::test]
    async fn test_combine_short_circuits_on_rejection() {
        let limiter = limiter();
        let burst: Arc<dyn Limiter> = Arc::new(limiter.burst_control(1, 1));
        let steady: Arc<dyn Limiter> =
            Arc::new(limiter.per_user_limit("api", WindowLimit::new(100, 60)));
        let combined = combine(vec![burst, steady]);
        let ctx = RequestContext::for_user("carol", "192.0.2.1");

        let first = combined.check(&ctx).await;
        assert!(first.allowed);
        // Burst allows 1 (remaining 0), steady has 99 left.
        assert_eq!(first.remaining, 0);

        let second = combined.check(&ctx).await;
        assert!(!second.allowed);

        // The steady limiter saw only the first request.
        let third = limiter
            .per_user_limit("api", WindowLimit::new(100, 60))
            .check(&ctx)
            .await;
        assert_eq!(third.remaining, 98);
    }

    #[tokio::test]
    async fn test_combine_empty_admits() {
        let combined = combine(Vec::new());
        assert!(combined.is_empty());
        assert!(combined.check(&RequestContext::for_ip("192.0.2.1")).await.allowed);
    }

    #[tokio::test]
    async fn test_combine_with_adaptive_ip() {
        let limiter = limiter();
        limiter.update_ip_reputation("198.51.100.7", Reputation::Bad).await;
        let adaptive: Arc<dyn Limiter> =
            Arc::new(limiter.per_ip_adaptive("ip", WindowLimit::new(10, 60)));
        let per_user: Arc<dyn Limiter> =
            Arc::new(limiter.per_user_limit("api", WindowLimit::new(10, 60)));
        let combined = combine(vec![adaptive, per_user]);
        let ctx = RequestContext::for_ip("198.51.100.7");

        assert!(combined.check(&ctx).await.allowed);
        assert!(!combined.check(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn test_by_user_tier_selects_limit() {
        let limiter = limiter();
        let tiers = TierLimits::new(TierLimit::new(1, Duration::from_secs(60)))
            .with_tier(UserTier::Free, TierLimit::new(2, Duration::from_secs(60)))
            .with_tier(UserTier::Premium, TierLimit::new(5, Duration::from_secs(60)));
        let tiered = by_user_tier(&limiter, tiers);

        let premium = RequestContext::for_user("p1", "192.0.2.2").with_tier(UserTier::Premium);
        assert_eq!(tiered.check(&premium).await.limit, 5);

        // No tier header: free. Basic has no entry: falls back to free.
        let anonymous = RequestContext::for_user("f1", "192.0.2.3");
        assert_eq!(tiered.check(&anonymous).await.limit, 2);
        let basic = RequestContext::for_user("b1", "192.0.2.4").with_tier(UserTier::Basic);
        assert_eq!(tiered.check(&basic).await.limit, 2);
    }

    #[test]
    fn test_tier_limits_from_json() {
        let raw = r#"{"premium": {"requests": 1000, "window": "1m"}, "free": {"requests": 50, "window": "30s"}}"#;
        let limits = TierLimits::from_json(raw, TierLimit::new(10, Duration::from_secs(60))).unwrap();

        assert_eq!(
            limits.limit_for(UserTier::Premium).window_limit(),
            WindowLimit::new(1000, 60)
        );
        assert_eq!(
            limits.limit_for(UserTier::Enterprise).window_limit(),
            WindowLimit::new(50, 30)
        );
        assert!(TierLimits::from_json("{\"gold\": {}}", TierLimit::new(1, Duration::from_secs(1))).is_err());
    }

    #[test]
    fn test_default_tiers_are_ordered() {
        let limits = TierLimits::default();
        assert!(limits.limit_for(UserTier::Free).requests < limits.limit_for(UserTier::Basic).requests);
        assert!(limits.limit_for(UserTier::Premium).requests < limits.limit_for(UserTier::Enterprise).requests);
    }
}
