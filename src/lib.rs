pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod invalidator;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod registry;
pub mod response;
pub mod server;
pub mod validation;

pub use cache::CacheStore;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use config::Config;
pub use error::{GuardError, Result};
pub use invalidator::CacheInvalidator;
pub use rate_limiter::{RateLimitResult, RateLimiter};
pub use registry::CircuitBreakerRegistry;
pub use server::create_app;
