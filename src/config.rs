//! Client configuration

use crate::error::{ClientError, Result};
use crate::token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL, without trailing slash (e.g. `http://localhost:8080/api`)
    pub base_url: String,

    /// Renewal endpoint, relative to `base_url`
    /// Default: `/auth/refresh`
    pub refresh_path: String,

    /// Route handed to the navigator when the session ends
    /// Default: `/login`
    pub login_route: String,

    /// Where tokens are persisted; `None` keeps them in memory only
    pub token_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            token_file: None,
        }
    }

    /// Build from `VENUE_API_URL` and `VENUE_TOKEN_FILE`
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("VENUE_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url);
        config.token_file = std::env::var_os("VENUE_TOKEN_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config
    }

    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Configuration(format!("invalid base URL {}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Configuration(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ClientError::Configuration(format!(
                "refresh path must start with '/': {}",
                self.refresh_path
            )));
        }
        Ok(())
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn refresh_url(&self) -> String {
        self.url(&self.refresh_path)
    }

    /// File-backed store when a token file is configured, memory otherwise
    pub fn open_token_store(&self) -> Arc<dyn TokenStore> {
        match &self.token_file {
            Some(path) => Arc::new(FileTokenStore::open(path)),
            None => Arc::new(MemoryTokenStore::new()),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
