use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::GuardError;
use crate::middleware::{TierLimit, TierLimits};
use crate::rate_limiter::{StoreFailurePolicy, WindowLimit};
use crate::validation::{validate_bind_address, validate_redis_url};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Service configuration. Every flag can also be set through the
/// environment variable named next to it.
#[derive(Debug, Clone, Parser)]
#[command(name = "bulwark", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: String,

    /// Redis connection URL; without it the cache store is in-process memory
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "CB_FAILURE_THRESHOLD", default_value_t = 5)]
    pub cb_failure_threshold: u32,

    #[arg(long, env = "CB_RESET_TIMEOUT_MS", default_value_t = 30_000)]
    pub cb_reset_timeout_ms: u64,

    #[arg(long, env = "CB_MONITORING_PERIOD_MS", default_value_t = 60_000)]
    pub cb_monitoring_period_ms: u64,

    #[arg(long, env = "CB_EXPECTED_ERROR_RATE", default_value_t = 0.5)]
    pub cb_expected_error_rate: f64,

    #[arg(long, env = "CB_HALF_OPEN_MAX_CALLS", default_value_t = 3)]
    pub cb_half_open_max_calls: u32,

    #[arg(long, env = "CB_MINIMUM_CALLS", default_value_t = 10)]
    pub cb_minimum_calls: u32,

    /// Requests per window allowed for each IP (scaled by reputation)
    #[arg(long, env = "RATE_LIMIT_REQUESTS", default_value_t = 100)]
    pub rate_limit_requests: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Requests allowed per burst window
    #[arg(long, env = "BURST_MAX", default_value_t = 20)]
    pub burst_max: u64,

    #[arg(long, env = "BURST_WINDOW_SECS", default_value_t = 1)]
    pub burst_window_secs: u64,

    /// How long an IP reputation lasts before it lapses
    #[arg(long, env = "REPUTATION_TTL_SECS", default_value_t = 3600)]
    pub reputation_ttl_secs: u64,

    /// Decision taken when the rate limit store is unreachable
    #[arg(long, env = "RATE_LIMIT_STORE_FAILURE", value_enum, default_value_t = StoreFailurePolicy::FailClosed)]
    pub rate_limit_store_failure: StoreFailurePolicy,

    /// JSON tier table, e.g. `{"free": {"requests": 100, "window": "1m"}}`
    #[arg(long, env = "TIER_LIMITS")]
    pub tier_limits: Option<String>,

    /// Honour `x-forwarded-for`, `x-real-ip`, `x-user-id` and `x-user-tier`.
    /// Only enable behind a proxy that sets or strips them.
    #[arg(long, env = "TRUST_PROXY_HEADERS")]
    pub trust_proxy_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            redis_url: None,
            log_level: "info".to_string(),
            cb_failure_threshold: breaker.failure_threshold,
            cb_reset_timeout_ms: breaker.reset_timeout_ms,
            cb_monitoring_period_ms: breaker.monitoring_period_ms,
            cb_expected_error_rate: breaker.expected_error_rate,
            cb_half_open_max_calls: breaker.half_open_max_calls,
            cb_minimum_calls: breaker.minimum_calls,
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
            burst_max: 20,
            burst_window_secs: 1,
            reputation_ttl_secs: 3600,
            rate_limit_store_failure: StoreFailurePolicy::default(),
            tier_limits: None,
            trust_proxy_headers: false,
        }
    }
}

impl Config {
    /// Default breaker settings for circuits created through the registry.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.cb_failure_threshold,
            reset_timeout_ms: self.cb_reset_timeout_ms,
            monitoring_period_ms: self.cb_monitoring_period_ms,
            expected_error_rate: self.cb_expected_error_rate,
            half_open_max_calls: self.cb_half_open_max_calls,
            minimum_calls: self.cb_minimum_calls,
        }
    }

    pub fn ip_limit(&self) -> WindowLimit {
        WindowLimit::new(self.rate_limit_requests, self.rate_limit_window_secs)
    }

    /// Tier table from `TIER_LIMITS`, or the built-in tiers. The base IP limit
    /// serves as the fallback for tiers the table leaves out.
    pub fn tier_limits(&self) -> Result<TierLimits, GuardError> {
        match &self.tier_limits {
            Some(raw) => {
                let fallback = TierLimit::new(
                    self.rate_limit_requests,
                    Duration::from_secs(self.rate_limit_window_secs),
                );
                TierLimits::from_json(raw, fallback)
            }
            None => Ok(TierLimits::default()),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, GuardError> {
        self.bind_addr.parse().map_err(|e| {
            GuardError::Configuration(format!("Invalid bind address '{}': {}", self.bind_addr, e))
        })
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        validate_bind_address(&self.bind_addr)
            .map_err(|e| GuardError::Configuration(e.to_string()))?;
        self.socket_addr()?;

        if let Some(url) = &self.redis_url {
            validate_redis_url(url).map_err(|e| GuardError::Configuration(e.to_string()))?;
        }

        self.breaker_config().validate()?;

        if self.rate_limit_requests == 0 || self.burst_max == 0 {
            return Err(GuardError::Configuration(
                "Rate limits must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit_window_secs == 0 || self.burst_window_secs == 0 {
            return Err(GuardError::Configuration(
                "Rate limit windows must be at least one second".to_string(),
            ));
        }

        self.tier_limits()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::UserTier;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker_config(), CircuitBreakerConfig::default());
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "bulwark",
            "--bind-addr",
            "0.0.0.0:8080",
            "--cb-failure-threshold",
            "2",
            "--rate-limit-store-failure",
            "fail-open",
            "--trust-proxy-headers",
        ])
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.breaker_config().failure_threshold, 2);
        assert_eq!(config.rate_limit_store_failure, StoreFailurePolicy::FailOpen);
        assert!(config.trust_proxy_headers);
        assert!(!Config::default().trust_proxy_headers);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = Config {
            redis_url: Some("http://localhost:6379".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            cb_expected_error_rate: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            bind_addr: "localhost".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            burst_window_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_limits_from_env_value() {
        let config = Config {
            tier_limits: Some(r#"{"premium": {"requests": 900, "window": "2m"}}"#.to_string()),
            ..Config::default()
        };
        let tiers = config.tier_limits().unwrap();
        assert_eq!(tiers.limit_for(UserTier::Premium).window_limit(), WindowLimit::new(900, 120));
        // No free entry: the base IP limit applies
        assert_eq!(tiers.limit_for(UserTier::Basic).window_limit(), WindowLimit::new(100, 60));

        let broken = Config {
            tier_limits: Some("not json".to_string()),
            ..Config::default()
        };
        assert!(broken.validate().is_err());
    }
}
