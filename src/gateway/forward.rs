//! Authenticated forwarding to the upstream data API
//!
//! Wraps reqwest::Client with app token injection from the [`TokenManager`].

use axum::body::Bytes;
use serde_json::Value;
use std::time::Duration;

use crate::auth::TokenManager;
use crate::error::{ProxyError, ProxyResult};

/// Forwards gateway requests upstream with the app credentials attached
#[derive(Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    api_base_url: String,
    tokens: TokenManager,
}

impl Forwarder {
    /// Build the forwarder; a `timeout` of `None` leaves outbound calls unbounded
    pub fn new(
        api_base_url: &str,
        tokens: TokenManager,
        timeout: Option<Duration>,
    ) -> ProxyResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Upstream URL for a stripped gateway path
    ///
    /// The tail is appended verbatim; callers own any percent-encoding.
    pub fn upstream_url(&self, tail: &str) -> String {
        format!("{}/{}", self.api_base_url, tail)
    }

    /// Fetch `tail` upstream and return the stamped JSON body, serialized
    pub async fn handle(&self, tail: &str) -> ProxyResult<Bytes> {
        if path_part(tail).is_empty() {
            return Err(ProxyError::BadRequest);
        }

        let url = self.upstream_url(tail);
        tracing::debug!("Upstream GET {}", url);

        let token = self.tokens.ensure_valid_token().await?;

        let resp = self
            .http
            .get(&url)
            .header("Client-ID", self.tokens.client_id())
            .bearer_auth(&token.value)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            tracing::warn!(status = status.as_u16(), "Upstream GET {} failed", url);
            return Err(ProxyError::UpstreamFetch {
                status: status.as_u16(),
            });
        }

        let raw = resp.bytes().await?;
        let mut body = match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => value,
            // Relay non-JSON payloads as a JSON string.
            Err(_) => Value::String(String::from_utf8_lossy(&raw).into_owned()),
        };
        stamp_last_updated(&mut body, chrono::Utc::now().timestamp_millis());

        let encoded = serde_json::to_vec(&body)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("Failed to encode body: {e}")))?;
        Ok(Bytes::from(encoded))
    }
}

/// Tail without its query string
pub fn path_part(tail: &str) -> &str {
    tail.split_once('?').map_or(tail, |(path, _)| path)
}

/// Merge `last_updated` into object bodies; arrays and scalars pass through
pub fn stamp_last_updated(body: &mut Value, now_ms: i64) {
    if let Value::Object(map) = body {
        map.insert("last_updated".to_string(), Value::from(now_ms));
    }
}
