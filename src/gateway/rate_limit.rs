//! Fixed-window rate limiting per client address

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::AppState;
use crate::config::RateLimitConfig;
use crate::error::ProxyError;

/// Outcome of [`RateLimiter::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Per-client request counter over fixed windows of `window` length
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.max_requests, config.window())
    }

    pub fn with_limits(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn admit(&self, client_key: &str) -> Admission {
        self.admit_at(client_key, Instant::now())
    }

    /// Count one request from `client_key` at `now`
    ///
    /// A rejected request is not counted, so the window stays at the cap.
    pub fn admit_at(&self, client_key: &str, now: Instant) -> Admission {
        let mut slot = self
            .windows
            .entry(client_key.to_string())
            .or_insert(RateWindow {
                count: 0,
                window_start: now,
            });
        let window = slot.value_mut();

        if now.saturating_duration_since(window.window_start) >= self.window {
            window.count = 0;
            window.window_start = now;
        }

        if window.count >= self.max_requests {
            let elapsed = now.saturating_duration_since(window.window_start);
            return Admission::Rejected {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }

        window.count += 1;
        Admission::Allowed {
            remaining: self.max_requests - window.count,
        }
    }

    /// Forget clients whose window closed before `now`
    pub fn purge_stale(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Resolve the identity a request is rate limited under
///
/// Forwarding headers are honoured only when the gateway is configured to sit
/// behind a trusted reverse proxy; otherwise a client could pick its own key.
pub fn client_key(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// Middleware rejecting over-quota clients before any other processing
pub async fn rate_limiting(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let key = client_key(request.headers(), peer, state.trust_forwarded_for);

    match state.limiter.admit(&key) {
        Admission::Allowed { remaining } => {
            tracing::trace!(client = %key, remaining, "Request admitted");
            next.run(request).await
        }
        Admission::Rejected { retry_after } => {
            tracing::warn!(client = %key, path = %request.uri().path(), "Rate limit exceeded");
            ProxyError::RateLimited {
                retry_after: retry_after.as_secs().max(1),
            }
            .into_response()
        }
    }
}
