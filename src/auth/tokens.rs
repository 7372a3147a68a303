//! Token storage and management

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProxyError, ProxyResult};

/// Key of the shared slot holding the app access token
pub const TOKEN_SLOT: &str = "helix-proxy:app-access-token";

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// App access token obtained through the client-credentials grant
///
/// Never mutated once issued: a refresh produces a new value that replaces the
/// stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    /// Unix seconds at which the exchange completed
    pub issued_at: u64,
    /// Lifetime declared by the authorization endpoint, in seconds
    pub expires_in: u64,
}

impl AccessToken {
    pub fn new(value: String, expires_in: u64) -> Self {
        Self::issued_at(value, unix_now(), expires_in)
    }

    pub fn issued_at(value: String, issued_at: u64, expires_in: u64) -> Self {
        Self {
            value,
            issued_at,
            expires_in,
        }
    }

    pub fn expires_at(&self) -> u64 {
        self.issued_at.saturating_add(self.expires_in)
    }

    /// Whether the token is usable at `now`
    ///
    /// A token is usable strictly before its expiry instant, less `margin`
    /// seconds of head start on the refresh.
    pub fn is_valid_at(&self, now: u64, margin: u64) -> bool {
        now.saturating_add(margin) < self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        !self.is_valid_at(unix_now(), 0)
    }
}

/// Key-value backend shared by every gateway instance
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> ProxyResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> ProxyResult<()>;
    async fn delete(&self, key: &str) -> ProxyResult<()>;
}

/// Typed view of the token slot in a [`KeyValueStore`]
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Load the stored token
    ///
    /// A value that no longer decodes counts as absent.
    pub async fn load(&self) -> ProxyResult<Option<AccessToken>> {
        let Some(raw) = self.backend.get(TOKEN_SLOT).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                tracing::warn!("Discarding undecodable stored token: {}", e);
                Ok(None)
            }
        }
    }

    /// Overwrite the slot
    ///
    /// Concurrent writers race; the last write wins.
    pub async fn save(&self, token: &AccessToken) -> ProxyResult<()> {
        let raw = serde_json::to_string(token)
            .map_err(|e| ProxyError::Store(format!("Failed to encode token: {e}")))?;
        self.backend.set(TOKEN_SLOT, raw).await
    }

    pub async fn clear(&self) -> ProxyResult<()> {
        self.backend.delete(TOKEN_SLOT).await
    }
}
