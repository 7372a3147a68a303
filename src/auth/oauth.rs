//! Client-credentials exchange and the token lifecycle

use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthType, AuthUrl, ClientId, ClientSecret,
    RequestTokenError, TokenResponse, TokenUrl,
};
use secrecy::ExposeSecret;

use super::tokens::{unix_now, AccessToken, CredentialStore};
use super::ClientCredentials;
use crate::error::{ProxyError, ProxyResult};

/// Build the OAuth2 client for the client-credentials grant
///
/// Credentials travel in the form body rather than a Basic auth header.
fn build_client(credentials: &ClientCredentials) -> ProxyResult<BasicClient> {
    let token_url = TokenUrl::new(credentials.token_url.clone())
        .map_err(|e| ProxyError::UpstreamAuth(format!("Invalid token URL: {e}")))?;
    // The grant never visits an authorize endpoint, but the client wants one.
    let auth_url = AuthUrl::new(credentials.token_url.clone())
        .map_err(|e| ProxyError::UpstreamAuth(format!("Invalid token URL: {e}")))?;

    Ok(BasicClient::new(
        ClientId::new(credentials.client_id.clone()),
        Some(ClientSecret::new(
            credentials.client_secret.expose_secret().clone(),
        )),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(AuthType::RequestBody))
}

/// Decides when the shared app token must be re-issued
///
/// Nothing is cached in memory: every call consults the [`CredentialStore`],
/// so a refresh performed by another instance is seen immediately.
#[derive(Clone)]
pub struct TokenManager {
    credentials: ClientCredentials,
    store: CredentialStore,
    refresh_margin_secs: u64,
}

impl TokenManager {
    pub fn new(credentials: ClientCredentials, store: CredentialStore) -> Self {
        Self {
            credentials,
            store,
            refresh_margin_secs: 0,
        }
    }

    /// Refresh this many seconds ahead of the declared expiry
    pub fn with_refresh_margin(mut self, secs: u64) -> Self {
        self.refresh_margin_secs = secs;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Return a usable app token, exchanging credentials when the stored one is stale
    ///
    /// A fresh token is persisted before it is returned.
    ///
    /// Concurrent callers that all see an expired token each run their own
    /// exchange; the last one to write wins.
    pub async fn ensure_valid_token(&self) -> ProxyResult<AccessToken> {
        if let Some(token) = self.store.load().await? {
            if token.is_valid_at(unix_now(), self.refresh_margin_secs) {
                return Ok(token);
            }
            tracing::info!(
                expired_at = token.expires_at(),
                "App access token expired, refreshing..."
            );
        } else {
            tracing::info!("No app access token stored, requesting one...");
        }

        self.refresh().await
    }

    /// Unconditionally run one credential exchange and persist the result
    ///
    /// On failure the store is left untouched.
    pub async fn refresh(&self) -> ProxyResult<AccessToken> {
        let token = self.exchange().await?;
        self.store.save(&token).await?;
        tracing::info!(expires_in = token.expires_in, "App access token refreshed");
        Ok(token)
    }

    async fn exchange(&self) -> ProxyResult<AccessToken> {
        let client = build_client(&self.credentials)?;

        let token_response = client
            .exchange_client_credentials()
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                let reason = match &e {
                    RequestTokenError::ServerResponse(resp) => {
                        format!("authorization server rejected the request ({})", resp.error())
                    }
                    RequestTokenError::Request(err) => format!("request failed: {err}"),
                    RequestTokenError::Parse(err, _) => {
                        format!("unexpected authorization response: {err}")
                    }
                    RequestTokenError::Other(msg) => msg.clone(),
                };
                tracing::warn!("Credential exchange failed: {}", reason);
                ProxyError::UpstreamAuth(reason)
            })?;

        let expires_in = token_response
            .expires_in()
            .map(|d| d.as_secs())
            .ok_or_else(|| {
                ProxyError::UpstreamAuth("authorization response missing expires_in".to_string())
            })?;

        Ok(AccessToken::new(
            token_response.access_token().secret().to_string(),
            expires_in,
        ))
    }
}
