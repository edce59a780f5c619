use crate::cache::{CacheStore, MemoryBackend, RedisBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::GuardError;
use crate::handlers::{
    get_circuit, get_reputation, health_check, invalidate_cache, list_circuits, metrics,
    open_circuit, rate_limit_check, readiness_check, reset_all_circuits, reset_circuit,
    set_reputation, AppState,
};
use crate::middleware::{
    by_user_tier, combine, enforce_rate_limit, logging_middleware, RateLimitState,
};
use crate::rate_limiter::{Limiter, RateLimiter};
use crate::registry::CircuitBreakerRegistry;
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Name of the breaker guarding the shared cache store.
pub const CACHE_STORE_CIRCUIT: &str = "cache-store";

pub struct Server {
    app: Router,
    addr: SocketAddr,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, GuardError> {
        let addr = config.socket_addr()?;
        let app = create_app(&config).await?;
        Ok(Self { app, addr })
    }

    pub async fn run(self) -> Result<(), GuardError> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| GuardError::Internal(format!("Failed to bind {}: {}", self.addr, e)))?;

        tracing::info!("Bulwark server listening on {}", self.addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GuardError::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

/// Build the application with the system clock.
pub async fn create_app(config: &Config) -> Result<Router, GuardError> {
    create_app_with_clock(config, Arc::new(SystemClock::new())).await
}

/// Wire the registry, cache store, limiter and routes. With `REDIS_URL`
/// unset, the store is process-local memory.
pub async fn create_app_with_clock(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<Router, GuardError> {
    let registry = Arc::new(CircuitBreakerRegistry::with_clock(
        config.breaker_config(),
        clock.clone(),
    ));

    let cache = match &config.redis_url {
        Some(url) => {
            let backend = RedisBackend::new(url)?.connect_or_degrade().await;
            CacheStore::new(Arc::new(backend)).with_breaker(registry.get(CACHE_STORE_CIRCUIT))
        }
        None => {
            tracing::info!("No Redis URL configured, using in-memory cache store");
            CacheStore::new(Arc::new(MemoryBackend::with_clock(clock.clone())))
        }
    };

    let rate_limiter = RateLimiter::new(cache.clone())
        .with_clock(clock.clone())
        .with_policy(config.rate_limit_store_failure)
        .with_reputation_ttl(config.reputation_ttl_secs);

    let burst: Arc<dyn Limiter> =
        Arc::new(rate_limiter.burst_control(config.burst_max, config.burst_window_secs));
    let adaptive: Arc<dyn Limiter> = Arc::new(rate_limiter.per_ip_adaptive("ip", config.ip_limit()));
    let tiered: Arc<dyn Limiter> = Arc::new(by_user_tier(&rate_limiter, config.tier_limits()?));
    let limiter: Arc<dyn Limiter> = Arc::new(combine(vec![burst, adaptive, tiered]));

    let state = AppState::new(registry, rate_limiter, cache);
    let limits =
        RateLimitState::new(limiter, clock).with_trusted_headers(config.trust_proxy_headers);
    Ok(router(state, limits))
}

/// Routes: health endpoints are never limited, everything else sits behind
/// `limits`.
pub fn router(state: AppState, limits: RateLimitState) -> Router {
    let guarded = Router::new()
        .route("/metrics", get(metrics))
        .route("/circuits", get(list_circuits))
        .route("/circuits/reset", post(reset_all_circuits))
        .route("/circuits/:name", get(get_circuit))
        .route("/circuits/:name/open", post(open_circuit))
        .route("/circuits/:name/reset", post(reset_circuit))
        .route("/rate-limit/check", post(rate_limit_check))
        .route("/reputation/:ip", put(set_reputation).get(get_reputation))
        .route("/cache/invalidate", post(invalidate_cache))
        .route_layer(middleware::from_fn_with_state(limits, enforce_rate_limit));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(guarded)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
