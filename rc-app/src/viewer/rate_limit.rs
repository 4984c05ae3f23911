//! Fixed-window request limiter shared by every viewer route.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<Window>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Exceeded { retry_after: Duration },
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn check(&self) -> RateLimitResult {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> RateLimitResult {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.saturating_duration_since(state.started);
        if elapsed >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count >= self.max_requests {
            let elapsed = now.saturating_duration_since(state.started);
            return RateLimitResult::Exceeded {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }
        state.count += 1;
        RateLimitResult::Allowed {
            remaining: self.max_requests - state.count,
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check() {
        RateLimitResult::Allowed { .. } => next.run(req).await,
        RateLimitResult::Exceeded { retry_after } => {
            tracing::warn!(path = %req.uri().path(), "viewer rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "status": "error",
                    "error": "too many requests, please try again later"
                })),
            )
                .into_response();
            let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            response
        }
    }
}
