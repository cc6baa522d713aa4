//! Client configuration: server address, timeouts, default headers, retry
//! policy and auth endpoints. Loaded from a JSON file where every field is
//! optional.

use anyhow::{Context, Result};
use log::debug;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::http::{RetryPolicy, header_pair};

/// Paths of the authentication endpoints, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login_path: String,
    pub refresh_path: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login_path: "/api/v1/auth/login".to_string(),
            refresh_path: "/api/v1/auth/refresh".to_string(),
        }
    }
}

/// Client configuration, usually read from `config.json`.
///
/// Every field is optional in the file; missing ones take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_tls: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub default_headers: BTreeMap<String, String>,
    pub retry: RetryPolicy,
    pub auto_refresh: bool,
    pub user_agent: String,
    pub auth: AuthEndpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            use_tls: true,
            verify_tls: true,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            default_headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            auto_refresh: true,
            user_agent: format!("reqauth/{}", env!("REQAUTH_VERSION")),
            auth: AuthEndpoints::default(),
        }
    }
}

impl ClientConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// `<config dir>/reqauth/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("reqauth").join("config.json"))
    }

    /// Config pointing at `base_url`, e.g. `http://127.0.0.1:8080`.
    pub fn from_base_url(base_url: &str) -> Result<Self> {
        let mut config = Self::default();
        config.set_base_url(base_url)?;
        Ok(config)
    }

    /// Replaces scheme, host and port from `base_url`.
    pub fn set_base_url(&mut self, base_url: &str) -> Result<()> {
        let url = Url::parse(base_url).with_context(|| format!("Invalid base URL: {}", base_url))?;
        let host = url
            .host_str()
            .with_context(|| format!("Base URL has no host: {}", base_url))?;
        self.use_tls = url.scheme() == "https";
        self.host = host.to_string();
        self.port = url
            .port_or_known_default()
            .with_context(|| format!("Base URL has no port: {}", base_url))?;
        Ok(())
    }

    /// `scheme://host:port` assembled from the config.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.use_tls { "https" } else { "http" };
        let raw = format!("{}://{}:{}", scheme, self.host, self.port);
        Url::parse(&raw).with_context(|| format!("Invalid server address: {}", raw))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn default_header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.default_headers {
            let (name, value) = header_pair(key, value)?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}
