//! Token provider implementations.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::http::{ApiClient, Transport};

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenGrant {
    pub access_token: String,
    /// Replacement refresh token, when the server rotates it.
    pub refresh_token: Option<String>,
}

/// Knows how to exchange a refresh token for a new access token.
///
/// Completion may happen on any thread; callers only await the result.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Provider for stores that only hold tokens. Every refresh is declined.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

#[async_trait]
impl TokenProvider for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        bail!("token refresh is not supported")
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

/// Provider that posts the refresh token to a refresh endpoint.
///
/// Uses a dedicated [`ApiClient`] with an empty token store, so refresh calls
/// never carry a bearer header and never trigger a nested refresh.
pub struct HttpTokenProvider {
    client: ApiClient,
    refresh_path: String,
}

impl HttpTokenProvider {
    pub fn new(client: ApiClient, refresh_path: impl Into<String>) -> Self {
        Self {
            client,
            refresh_path: refresh_path.into(),
        }
    }

    /// Builds the provider on its own client sharing `transport`.
    ///
    /// Only 503 is retried on the refresh endpoint; an auth failure there is
    /// final.
    pub fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut config = config.clone();
        config.auto_refresh = false;
        config.retry.retryable_status_codes.retain(|code| *code == 503);

        let client = ApiClient::builder(config.clone())
            .transport(transport)
            .build()
            .context("Failed to build refresh client")?;
        Ok(Self::new(client, config.auth.refresh_path))
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    #[tracing::instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        if refresh_token.is_empty() {
            bail!("no refresh token available");
        }

        debug!("Requesting new access token from {}", self.refresh_path);
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let outcome = self.client.post_json(&self.refresh_path, &body).await;
        if !outcome.is_success() {
            bail!(
                "refresh endpoint returned {}: {}",
                outcome.status(),
                outcome.error_message().unwrap_or_default()
            );
        }

        let response: RefreshResponse = outcome.json()?;
        if response.access_token.is_empty() {
            bail!("refresh response carried no access token");
        }

        Ok(TokenGrant {
            access_token: response.access_token,
            refresh_token: Some(response.refresh_token).filter(|t| !t.is_empty()),
        })
    }
}
