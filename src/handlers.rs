use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::error::GuardError;
use crate::health::HealthChecker;
use crate::invalidator::{CacheInvalidator, EntityChange};
use crate::middleware::{apply_rate_limit_headers, check_rate_limit};
use crate::rate_limiter::RateLimiter;
use crate::registry::CircuitBreakerRegistry;
use crate::response::{
    ActionResponse, CacheMetrics, CircuitListResponse, CircuitResponse, MetricsResponse,
    RateLimitResponse, RateLimiterMetrics, ReputationResponse,
};
use crate::validation::{
    validate_body, validate_circuit_name, validate_entity_change, validate_ip,
    CheckRateLimitRequest, ReputationRequest,
};

/// Shared application state
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<CircuitBreakerRegistry>,
    pub rate_limiter: RateLimiter,
    pub cache: CacheStore,
    pub invalidator: CacheInvalidator,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(
        registry: Arc<CircuitBreakerRegistry>,
        rate_limiter: RateLimiter,
        cache: CacheStore,
    ) -> Self {
        Self {
            invalidator: CacheInvalidator::new(cache.clone()),
            health: HealthChecker::new(cache.clone(), registry.clone()),
            registry,
            rate_limiter,
            cache,
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_ready().await {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "cache": state.cache.backend_name()
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "cache": state.cache.backend_name(),
                "note": "Cache store unreachable, rate limits are decided by the store-failure policy"
            })),
        )
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let limiter_metrics = state.rate_limiter.metrics();
    Json(MetricsResponse {
        rate_limiter: RateLimiterMetrics {
            totals: limiter_metrics.totals().await,
            scopes: limiter_metrics.snapshot().await,
        },
        circuits: state.registry.get_all_stats(),
        cache: CacheMetrics {
            backend: state.cache.backend_name().to_string(),
            connected: state.cache.is_connected(),
        },
    })
}

pub async fn list_circuits(State(state): State<AppState>) -> impl IntoResponse {
    Json(CircuitListResponse {
        circuits: state.registry.get_all_stats(),
        open_circuits: state.registry.open_circuits(),
    })
}

/// Stats for an existing circuit; lookups never create one.
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GuardError> {
    validate_circuit_name(&name)?;

    let breakers = state.registry.get_all();
    let breaker = breakers
        .get(&name)
        .ok_or_else(|| GuardError::NotFound(format!("circuit '{}'", name)))?;

    Ok(Json(CircuitResponse::new(name.clone(), breaker.stats())))
}

/// Force a circuit open, creating it if it does not exist yet.
pub async fn open_circuit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GuardError> {
    validate_circuit_name(&name)?;

    let breaker = state.registry.get(&name);
    breaker.open();
    tracing::warn!(circuit = %name, "Circuit forced open");

    Ok(Json(CircuitResponse::new(name, breaker.stats())))
}

pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GuardError> {
    validate_circuit_name(&name)?;

    let breaker = state.registry.get(&name);
    breaker.reset();
    tracing::info!(circuit = %name, "Circuit reset");

    Ok(Json(CircuitResponse::new(name, breaker.stats())))
}

pub async fn reset_all_circuits(State(state): State<AppState>) -> impl IntoResponse {
    state.registry.reset_all();
    Json(ActionResponse::success(format!(
        "Reset {} circuits",
        state.registry.len()
    )))
}

/// Count one request against an ad-hoc limit
pub async fn rate_limit_check(
    State(state): State<AppState>,
    Json(payload): Json<CheckRateLimitRequest>,
) -> Result<Response, GuardError> {
    validate_body(&payload)?;

    let result = check_rate_limit(
        &state.rate_limiter,
        &payload.subject,
        payload.limit,
        payload.window_seconds,
    )
    .await;
    let body = RateLimitResponse::from_result(&result, state.rate_limiter.clock().now_secs());
    let retry_after = body.retry_after;

    let mut resp = Json(body).into_response();
    apply_rate_limit_headers(resp.headers_mut(), &result);

    if let Some(retry_after) = retry_after {
        *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            resp.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }

    Ok(resp)
}

pub async fn set_reputation(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Json(payload): Json<ReputationRequest>,
) -> Result<impl IntoResponse, GuardError> {
    let ip = validate_ip(&ip)?.to_string();
    state
        .rate_limiter
        .update_ip_reputation(&ip, payload.reputation)
        .await;

    Ok(Json(ReputationResponse {
        ip,
        reputation: Some(payload.reputation),
        ttl_seconds: Some(state.rate_limiter.reputation_ttl()),
    }))
}

pub async fn get_reputation(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<impl IntoResponse, GuardError> {
    let ip = validate_ip(&ip)?.to_string();
    let reputation = state.rate_limiter.ip_reputation(&ip).await;

    Ok(Json(ReputationResponse {
        ip,
        reputation,
        ttl_seconds: None,
    }))
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(change): Json<EntityChange>,
) -> Result<impl IntoResponse, GuardError> {
    validate_entity_change(&change)?;
    Ok(Json(state.invalidator.invalidate(&change).await))
}
