//! Authentication module for the upstream API
//!
//! Implements the OAuth2 client-credentials grant and keeps the resulting app
//! access token in a key-value slot shared by every gateway instance.

pub mod oauth;
pub mod store;
pub mod tokens;

use anyhow::Result;
use secrecy::SecretString;

pub use oauth::TokenManager;
pub use store::{FileStore, MemoryStore};
pub use tokens::{AccessToken, CredentialStore, KeyValueStore};

/// Confidential client registered with the upstream authorization server
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// OAuth2 client ID, also sent as `Client-ID` on data calls
    pub client_id: String,
    /// OAuth2 client secret, never leaves the gateway
    pub client_secret: SecretString,
    /// Token endpoint accepting the client-credentials grant
    pub token_url: String,
}

/// Force a credential exchange and persist the new token
pub async fn refresh(manager: &TokenManager) -> Result<()> {
    let token = manager.refresh().await?;
    println!("App access token refreshed.");
    println!("  expires_at: {}", token.expires_at());
    Ok(())
}

/// Clear the stored token
pub async fn logout(manager: &TokenManager) -> Result<()> {
    manager.store().clear().await?;
    println!("Stored app access token cleared.");
    Ok(())
}

/// Display the state of the shared credential slot
pub async fn status(manager: &TokenManager) -> Result<()> {
    println!("Client ID:   {}", manager.client_id());

    match manager.store().load().await? {
        Some(token) if !token.is_expired() => {
            println!("App token:   valid");
            println!("  issued_at:  {}", token.issued_at);
            println!("  expires_at: {}", token.expires_at());
        }
        Some(token) => {
            println!("App token:   expired");
            println!("  expired_at: {}", token.expires_at());
        }
        None => {
            println!("App token:   none");
            println!("\nRun 'helix-proxy refresh' to request one.");
        }
    }

    Ok(())
}
