//! HTTP gateway
//!
//! Pipeline per request: rate limiter, `/api/` prefix gate, response cache,
//! then the forwarder (which consults the token manager).

pub mod cache;
pub mod forward;
pub mod rate_limit;

use anyhow::{bail, Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

use crate::auth::{CredentialStore, FileStore, KeyValueStore, MemoryStore, TokenManager};
use crate::config::{Config, StoreBackend};
use crate::error::{ProxyError, ProxyResult};

pub use cache::{ResponseCache, RESPONSE_TTL};
pub use forward::Forwarder;
pub use rate_limit::RateLimiter;

/// Prefix of every forwarded path
pub const API_PREFIX: &str = "/api/";

/// Shared per-process gateway state
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Forwarder,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(forwarder: Forwarder, cache: ResponseCache, limiter: RateLimiter) -> Self {
        Self {
            forwarder,
            cache: Arc::new(cache),
            limiter: Arc::new(limiter),
            trust_forwarded_for: false,
        }
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Wire up every component from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = CredentialStore::new(open_store(config).await?);
        let tokens = TokenManager::new(config.credentials()?, store)
            .with_refresh_margin(config.upstream.refresh_margin_secs);
        let forwarder = Forwarder::new(
            &config.upstream.api_base_url,
            tokens,
            config.upstream.timeout_secs.map(Duration::from_secs),
        )
        .context("Failed to build upstream HTTP client")?;

        Ok(Self::new(
            forwarder,
            ResponseCache::default(),
            RateLimiter::new(&config.rate_limit),
        )
        .trust_forwarded_for(config.server.trust_forwarded_for))
    }
}

/// Open the configured credential store backend
pub async fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory credential store; tokens are not shared");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::File => {
            let path = match &config.store.path {
                Some(p) => p.clone(),
                None => Config::default_store_path()?,
            };
            let store = FileStore::new(path);
            tracing::info!("Credential store: {}", store.path().display());
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is not configured")?;
            let store = crate::auth::store::RedisStore::connect(url).await?;
            tracing::info!("Credential store: redis");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            bail!("Redis credential store requires building with the `redis` feature")
        }
    }
}

/// Build the router
///
/// Every path lands in [`proxy`], which applies the prefix gate itself so that
/// a query string survives into the forwarded URL.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limiting,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Strip the gateway prefix, returning the tail (path and query) to forward
pub fn strip_prefix(uri: &Uri) -> ProxyResult<&str> {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());

    if let Some(tail) = path_and_query.strip_prefix(API_PREFIX) {
        return Ok(tail);
    }
    // `/api` and `/api?...` are the bare prefix.
    let bare = API_PREFIX.trim_end_matches('/');
    match path_and_query.strip_prefix(bare) {
        Some(rest) if rest.is_empty() || rest.starts_with('?') => Err(ProxyError::BadRequest),
        _ => Err(ProxyError::Forbidden),
    }
}

async fn proxy(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    match forward_request(&state, &method, &uri).await {
        Ok(body) => json_response(body),
        Err(err) => {
            if err.status_code().is_server_error() {
                tracing::error!(path = %uri.path(), "Forwarding failed: {}", err);
            } else {
                tracing::debug!(path = %uri.path(), "Rejected: {}", err);
            }
            err.into_response()
        }
    }
}

async fn forward_request(
    state: &AppState,
    method: &Method,
    uri: &Uri,
) -> ProxyResult<Bytes> {
    let tail = strip_prefix(uri)?;
    if *method != Method::GET {
        return Err(ProxyError::MethodNotAllowed);
    }
    if forward::path_part(tail).is_empty() {
        return Err(ProxyError::BadRequest);
    }

    tracing::debug!("Query: {}", tail);

    if let Some(body) = state.cache.get(tail) {
        tracing::debug!("Cache hit for {}", tail);
        return Ok(body);
    }

    let body = state.forwarder.handle(tail).await?;
    state.cache.put(tail, body.clone());
    Ok(body)
}

fn json_response(body: Bytes) -> Response {
    let max_age = format!("max-age={}", RESPONSE_TTL.as_secs());
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&max_age) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

/// Periodically drop expired cache entries and closed rate windows
fn spawn_janitor(state: &AppState) {
    let cache = state.cache.clone();
    let limiter = state.limiter.clone();
    let period = cache.ttl().min(limiter.window()).max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let purged = cache.purge_expired(now) + limiter.purge_stale(now);
            if purged > 0 {
                tracing::debug!(purged, "Evicted expired gateway state");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Run the gateway until interrupted
pub async fn serve(config: &Config) -> Result<()> {
    let state = AppState::from_config(config).await?;
    spawn_janitor(&state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!("Server is running on {}", addr);
    tracing::info!(
        "Rate limit: {} requests per {}s per client",
        config.rate_limit.max_requests,
        config.rate_limit.window_secs
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, ClientCredentials};
    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        state: AppState,
        store: CredentialStore,
    }

    fn harness(server: &MockServer, ttl: Duration, max_requests: u32) -> Harness {
        let store = CredentialStore::new(Arc::new(MemoryStore::new()));
        let credentials = ClientCredentials {
            client_id: "test-client".to_string(),
            client_secret: SecretString::new("test-secret".to_string()),
            token_url: format!("{}/oauth2/token", server.uri()),
        };
        let tokens = TokenManager::new(credentials, store.clone());
        let forwarder =
            Forwarder::new(&format!("{}/helix", server.uri()), tokens, None).unwrap();
        let state = AppState::new(
            forwarder,
            ResponseCache::new(ttl),
            RateLimiter::with_limits(max_requests, Duration::from_secs(60)),
        );
        Harness { state, store }
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-token",
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn send(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        send_with(app, Method::GET, uri, &[]).await
    }

    async fn send_with(
        app: &Router,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, bytes.to_vec())
    }

    #[test]
    fn test_strip_prefix() {
        let uri: Uri = "/api/users?login=a".parse().unwrap();
        assert_eq!(strip_prefix(&uri).unwrap(), "users?login=a");

        let uri: Uri = "/api/".parse().unwrap();
        assert_eq!(strip_prefix(&uri).unwrap(), "");

        let uri: Uri = "/api".parse().unwrap();
        assert!(matches!(strip_prefix(&uri), Err(ProxyError::BadRequest)));

        let uri: Uri = "/apiary".parse().unwrap();
        assert!(matches!(strip_prefix(&uri), Err(ProxyError::Forbidden)));

        let uri: Uri = "/other/path".parse().unwrap();
        assert!(matches!(strip_prefix(&uri), Err(ProxyError::Forbidden)));
    }

    #[tokio::test]
    async fn test_outside_prefix_is_forbidden_without_side_effects() {
        let server = MockServer::start().await;
        mount_token(&server, 0).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state.clone());

        let (status, _, body) = send(&app, "/other/path").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "Forbidden");

        assert!(h.state.cache.is_empty());
        assert!(h.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_tail_is_bad_request() {
        let server = MockServer::start().await;
        mount_token(&server, 0).await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state.clone());

        for uri in ["/api/", "/api", "/api/?login=a"] {
            let (status, _, body) = send(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "uri {uri}");
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["message"], "Bad Request - Missing query");
        }
        assert!(h.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let server = MockServer::start().await;
        mount_token(&server, 0).await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state);

        let (status, _, _) = send_with(&app, Method::POST, "/api/users", &[]).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cache_hit_is_byte_identical() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/helix/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state);

        let (status, headers, first) = send(&app, "/api/streams?first=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "max-age=300");
        let parsed: Value = serde_json::from_slice(&first).unwrap();
        assert!(parsed["last_updated"].is_i64());

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (status, headers, second) = send(&app, "/api/streams?first=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "max-age=300");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cache_expiry_refetches() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/helix/games/top"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&server, Duration::from_millis(50), 10);
        let app = router(h.state);

        let (_, _, first) = send(&app, "/api/games/top").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let (status, _, second) = send(&app, "/api/games/top").await;
        assert_eq!(status, StatusCode::OK);

        let first: Value = serde_json::from_slice(&first).unwrap();
        let second: Value = serde_json::from_slice(&second).unwrap();
        assert!(
            second["last_updated"].as_i64().unwrap() > first["last_updated"].as_i64().unwrap()
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_is_500_and_not_cached() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state.clone());

        for _ in 0..2 {
            let (status, _, body) = send(&app, "/api/users").await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert!(body["error"].as_str().unwrap().contains("401"));
        }
        assert!(h.state.cache.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_is_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_client"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&server, RESPONSE_TTL, 10);
        let app = router(h.state.clone());

        let (status, _, body) = send(&app, "/api/users").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].is_string());
        assert!(h.state.cache.is_empty());
    }

    #[tokio::test]
    async fn test_stored_token_is_used() {
        let server = MockServer::start().await;
        mount_token(&server, 0).await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(wiremock::matchers::header("Authorization", "Bearer from-store"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, RESPONSE_TTL, 10);
        h.store
            .save(&AccessToken::new("from-store".to_string(), 3600))
            .await
            .unwrap();
        let app = router(h.state);

        let (status, _, _) = send(&app, "/api/users").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_over_quota() {
        let server = MockServer::start().await;
        mount_token(&server, 0).await;

        let h = harness(&server, RESPONSE_TTL, 3);
        let app = router(h.state.trust_forwarded_for(true));

        let client_a = [("x-forwarded-for", "203.0.113.7")];
        for _ in 0..3 {
            let (status, _, _) = send_with(&app, Method::GET, "/other", &client_a).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
        let (status, headers, _) = send_with(&app, Method::GET, "/other", &client_a).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.contains_key(header::RETRY_AFTER));

        // Another client still has its own quota.
        let client_b = [("x-forwarded-for", "203.0.113.8")];
        let (status, _, _) = send_with(&app, Method::GET, "/other", &client_b).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
