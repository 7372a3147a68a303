//! Configuration loading
//!
//! Settings come from a TOML file (by default in the platform config
//! directory), then environment variables override individual values.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::ClientCredentials;

const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix";
const DEFAULT_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`
    ///
    /// Only enable behind a reverse proxy that sets these headers.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_forwarded_for: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Upstream endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Data call timeout; unset means outbound calls may wait indefinitely
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Refresh the app token this many seconds before it expires
    #[serde(default)]
    pub refresh_margin_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            token_url: default_token_url(),
            timeout_secs: None,
            refresh_margin_secs: 0,
        }
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

/// Fixed-window rate limit applied per client address
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    60
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Where the shared app token lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// File backend location; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "helix-proxy", "helix-proxy")
            .context("Could not determine config directory")
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Default location of the file-backed credential store
    pub fn default_store_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().join("credentials.json"))
    }

    /// Load configuration from `path` (or the default location)
    ///
    /// The environment is applied on top and the result validated. A missing
    /// file means all defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A .env file only fills variables that are not already set.
        dotenvy::dotenv().ok();

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    /// Apply environment overrides
    ///
    /// `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("TWITCH_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(secret) = lookup("TWITCH_CLIENT_SECRET") {
            self.client_secret = Some(SecretString::new(secret));
        }
        if let Some(host) = lookup("HELIX_PROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value {:?}", port),
            }
        }
        if let Some(url) = lookup("HELIX_PROXY_REDIS_URL") {
            self.store.redis_url = Some(url);
        }
    }

    /// Check that everything needed to serve is present and sane
    pub fn validate(&self) -> Result<()> {
        if self.client_id.as_deref().map_or(true, str::is_empty) {
            bail!("client_id is not configured (set TWITCH_CLIENT_ID or client_id)");
        }
        if self.client_secret.is_none() {
            bail!("client_secret is not configured (set TWITCH_CLIENT_SECRET or client_secret)");
        }
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be at least 1");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be at least 1");
        }
        url::Url::parse(&self.upstream.api_base_url)
            .with_context(|| format!("Invalid api_base_url {}", self.upstream.api_base_url))?;
        url::Url::parse(&self.upstream.token_url)
            .with_context(|| format!("Invalid token_url {}", self.upstream.token_url))?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            bail!("store.backend = \"redis\" requires store.redis_url");
        }
        Ok(())
    }

    /// Client credentials for the token manager
    pub fn credentials(&self) -> Result<ClientCredentials> {
        Ok(ClientCredentials {
            client_id: self
                .client_id
                .clone()
                .context("client_id is not configured")?,
            client_secret: self
                .client_secret
                .clone()
                .context("client_secret is not configured")?,
            token_url: self.upstream.token_url.clone(),
        })
    }

    /// Socket address string the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
