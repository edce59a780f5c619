//! Composition layer between request handlers and the core components.
//!
//! - [`cache`]: cache-aside wrapping of arbitrary operations
//! - [`limits`]: limiter composition (`combine`, `by_user_tier`, `check_rate_limit`)
//! - this module: axum glue that turns a request into a [`RequestContext`]
//!   and enforces a [`Limiter`] in front of the routes

pub mod cache;
pub mod limits;

pub use cache::CacheAside;
pub use limits::{
    by_user_tier, check_rate_limit, combine, CombinedLimit, TierLimit, TierLimits, TieredLimit,
};

use crate::clock::Clock;
use crate::error::GuardError;
use crate::rate_limiter::{Limiter, RateLimitResult, RequestContext, UserTier};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request, false);
    let forwarded_for = header_str(request.headers(), FORWARDED_FOR_HEADER).map(str::to_string);

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "bulwark::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        forwarded_for = ?forwarded_for,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "bulwark::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Shared state for [`enforce_rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<dyn Limiter>,
    pub clock: Arc<dyn Clock>,
    /// Whether proxy-supplied identity headers are believed.
    pub trust_proxy_headers: bool,
}

impl RateLimitState {
    pub fn new(limiter: Arc<dyn Limiter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter,
            clock,
            trust_proxy_headers: false,
        }
    }

    pub fn with_trusted_headers(mut self, trusted: bool) -> Self {
        self.trust_proxy_headers = trusted;
        self
    }
}

/// Reject requests over the limit with 429 and annotate admitted responses
/// with `X-RateLimit-*` headers.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request_context(&request, state.trust_proxy_headers);
    let result = state.limiter.check(&ctx).await;

    if !result.allowed {
        let retry_after = result.retry_after(state.clock.now_secs());
        let mut response = GuardError::RateLimitExceeded {
            reset_time: result.reset_time,
            retry_after,
        }
        .into_response();
        apply_rate_limit_headers(response.headers_mut(), &result);
        return response;
    }

    let mut response = next.run(request).await;
    // Handlers reporting on a limit of their own keep their headers
    if !response.headers().contains_key("x-ratelimit-limit") {
        apply_rate_limit_headers(response.headers_mut(), &result);
    }
    response
}

/// Build the limiter's view of a request.
///
/// Identity headers are only read when `trust_proxy_headers` is set, i.e. when
/// an authenticating proxy in front of this service owns them. Otherwise the
/// request is anonymous and keyed on the peer address.
pub fn request_context(request: &Request, trust_proxy_headers: bool) -> RequestContext {
    let headers = request.headers();
    let (user_id, tier) = if trust_proxy_headers {
        let user_id = header_str(headers, USER_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let tier =
            header_str(headers, USER_TIER_HEADER).and_then(|raw| raw.parse::<UserTier>().ok());
        (user_id, tier)
    } else {
        (None, None)
    };

    RequestContext {
        user_id,
        ip: get_client_ip(request, trust_proxy_headers),
        tier,
        path: request.uri().path().to_string(),
    }
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    if result.limit == u64::MAX {
        return;
    }
    let pairs = [
        ("x-ratelimit-limit", result.limit),
        ("x-ratelimit-remaining", result.remaining),
        ("x-ratelimit-reset", result.reset_time),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn get_client_ip(request: &Request, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = header_str(request.headers(), FORWARDED_FOR_HEADER) {
            if let Some(first_ip) = forwarded.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }

        if let Some(real_ip) = header_str(request.headers(), REAL_IP_HEADER) {
            return real_ip.trim().to_string();
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
