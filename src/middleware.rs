//! HTTP middleware: per-route rate limits, audit records, and response
//! security headers.

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::ServerConfig;
use crate::logging::AUDIT_TARGET;
use crate::server::AppError;

pub const SYNC_ROUTE: &str = "/api/v1/sync";

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of accepted requests per route.
#[derive(Debug)]
pub struct RateLimiter {
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    per_route: u32,
    sync: u32,
}

impl RateLimiter {
    pub fn new(per_route: u32, sync: u32) -> Arc<Self> {
        Arc::new(Self {
            hits: Mutex::new(HashMap::new()),
            per_route,
            sync,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Arc<Self> {
        Self::new(config.rate_limit_per_minute, config.sync_rate_limit_per_minute)
    }

    fn limit_for(&self, route: &str) -> u32 {
        if route == SYNC_ROUTE {
            self.sync
        } else {
            self.per_route
        }
    }

    /// Count one request on `route`, or return how long until the next one
    /// would be accepted.
    pub fn check(&self, route: &str) -> Result<(), Duration> {
        self.check_at(route, Instant::now())
    }

    fn check_at(&self, route: &str, now: Instant) -> Result<(), Duration> {
        let limit = self.limit_for(route) as usize;
        if limit == 0 {
            return Ok(());
        }

        let mut hits = self.hits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = hits.entry(route.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW)
        {
            window.pop_front();
        }

        if window.len() >= limit {
            let oldest = window.front().copied().unwrap_or(now);
            return Err(WINDOW.saturating_sub(now.saturating_duration_since(oldest)));
        }
        window.push_back(now);
        Ok(())
    }
}

fn route_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    let route = route_of(&request);
    match limiter.check(&route) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            // Whole seconds, rounded up.
            let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            tracing::warn!(
                target: AUDIT_TARGET,
                method = %request.method(),
                route = %route,
                retry_after,
                "rate limited"
            );
            AppError::rate_limited(retry_after.max(1)).into_response()
        }
    }
}

/// Emit one audit event per request.
pub async fn audit(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let route = route_of(&request);
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        target: AUDIT_TARGET,
        method = %method,
        route = %route,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Headers set on every response.
pub fn security_headers() -> [SetResponseHeaderLayer<HeaderValue>; 5] {
    let set = |name: HeaderName, value: &'static str| {
        SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
    };
    [
        set(header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        set(header::X_FRAME_OPTIONS, "DENY"),
        set(header::REFERRER_POLICY, "no-referrer"),
        set(
            header::CONTENT_SECURITY_POLICY,
            "default-src 'none'; frame-ancestors 'none'",
        ),
        set(header::CACHE_CONTROL, "no-store"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware::from_fn, routing::get, Router};
    use std::io;
    use tower::ServiceExt;

    #[test]
    fn test_window_limits_per_route() {
        let limiter = RateLimiter::new(2, 1);
        let start = Instant::now();

        assert!(limiter.check_at("/api/v1/query", start).is_ok());
        assert!(limiter.check_at("/api/v1/query", start).is_ok());
        assert!(limiter.check_at("/api/v1/query", start).is_err());
        assert!(limiter.check_at("/api/v1/stats", start).is_ok());

        assert!(limiter.check_at(SYNC_ROUTE, start).is_ok());
        let wait = limiter
            .check_at(SYNC_ROUTE, start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));

        assert!(limiter.check_at(SYNC_ROUTE, start + WINDOW).is_ok());
        assert!(limiter.check_at("/api/v1/query", start + WINDOW).is_ok());
    }

    #[test]
    fn test_zero_disables_limit() {
        let limiter = RateLimiter::new(0, 0);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.check_at(SYNC_ROUTE, now).is_ok());
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_audit_records_route_and_status() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route("/api/v1/documents/{id}", get(|| async { StatusCode::NOT_FOUND }))
            .route_layer(from_fn(audit));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/documents/AID-X-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.lines().last().unwrap()).unwrap();
        assert_eq!(line["target"], AUDIT_TARGET);
        assert_eq!(line["fields"]["route"], "/api/v1/documents/{id}");
        assert_eq!(line["fields"]["status"], 404);
        assert_eq!(line["fields"]["method"], "GET");
    }
}
