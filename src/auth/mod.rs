//! Token storage and refresh coordination.
//!
//! [`TokenStore`] owns the access/refresh token pair behind a single lock and
//! serializes refresh cycles: at most one refresh runs per store, and a
//! request that hit 401/403 while another request was already refreshing
//! shares that refresh's result: the newly installed token, or the same
//! error if it failed.

mod provider;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

pub use provider::{HttpTokenProvider, NoRefresh, TokenGrant, TokenProvider};

#[cfg(test)]
pub use provider::MockTokenProvider;

/// Current access and refresh tokens. Empty tokens are stored as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: non_empty(access_token.into()),
            refresh_token: non_empty(refresh_token.into()),
        }
    }
}

fn non_empty(token: String) -> Option<String> {
    Some(token).filter(|t| !t.is_empty())
}

/// Why a refresh cycle did not produce a new access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    NoProvider,
    MissingRefreshToken,
    Provider(String),
    EmptyToken,
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::NoProvider => write!(f, "Token refresh failed: No token provider"),
            RefreshError::MissingRefreshToken => {
                write!(f, "Token refresh failed: no refresh token available")
            }
            RefreshError::Provider(msg) => write!(f, "Token refresh failed: {}", msg),
            RefreshError::EmptyToken => write!(f, "Token refresh failed: empty access token"),
        }
    }
}

impl std::error::Error for RefreshError {}

#[derive(Debug, Default)]
struct TokenState {
    pair: TokenPair,
    /// Bumped on every mutation of `pair`.
    generation: u64,
    /// Number of finished refresh attempts, successful or not.
    attempts: u64,
    /// Error of the last attempt, with the generation it was made against.
    last_failure: Option<(u64, RefreshError)>,
}

/// Holds the token pair and runs refresh cycles. Safe to share across tasks.
pub struct TokenStore {
    state: Mutex<TokenState>,
    provider: RwLock<Option<Arc<dyn TokenProvider>>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenStore")
            .field("has_access_token", &state.pair.access_token.is_some())
            .field("has_refresh_token", &state.pair.refresh_token.is_some())
            .field("generation", &state.generation)
            .field("has_provider", &self.has_provider())
            .finish()
    }
}

impl TokenStore {
    /// Empty store without a refresh provider.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::default()),
            provider: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_provider(provider: Arc<dyn TokenProvider>) -> Self {
        let store = Self::new();
        store.set_provider(Some(provider));
        store
    }

    pub fn set_provider(&self, provider: Option<Arc<dyn TokenProvider>>) {
        *self.provider.write() = provider;
    }

    pub fn has_provider(&self) -> bool {
        self.provider.read().is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.lock().pair.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.lock().pair.refresh_token.clone()
    }

    pub fn tokens(&self) -> TokenPair {
        self.state.lock().pair.clone()
    }

    pub fn set_tokens(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        self.replace(TokenPair::new(access_token, refresh_token));
    }

    pub fn set_access_token(&self, token: impl Into<String>) {
        let mut state = self.state.lock();
        state.pair.access_token = non_empty(token.into());
        state.generation += 1;
    }

    pub fn set_refresh_token(&self, token: impl Into<String>) {
        let mut state = self.state.lock();
        state.pair.refresh_token = non_empty(token.into());
        state.generation += 1;
    }

    /// Forgets both tokens.
    pub fn clear(&self) {
        self.replace(TokenPair::default());
    }

    fn replace(&self, pair: TokenPair) {
        let mut state = self.state.lock();
        state.pair = pair;
        state.generation += 1;
    }

    /// Current access token together with the generation it belongs to.
    pub(crate) fn snapshot(&self) -> (Option<String>, u64) {
        let state = self.state.lock();
        (state.pair.access_token.clone(), state.generation)
    }

    /// Refreshes the access token now, or joins a refresh already in flight.
    pub async fn refresh_access_token(&self) -> Result<String, RefreshError> {
        let generation = self.state.lock().generation;
        self.refresh_after(generation).await
    }

    /// Refreshes the access token unless it already changed since
    /// `seen_generation`, in which case the newer token is returned as is.
    ///
    /// Callers that queued behind a failed attempt made against the same
    /// generation get that attempt's error without asking the provider again.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn refresh_after(&self, seen_generation: u64) -> Result<String, RefreshError> {
        let joined_at = self.state.lock().attempts;
        let _gate = self.refresh_gate.lock().await;

        let (refresh_token, attempt_generation) = {
            let state = self.state.lock();
            if state.generation != seen_generation {
                if let Some(token) = state.pair.access_token.clone() {
                    debug!("Access token changed while waiting, skipping refresh");
                    return Ok(token);
                }
            }
            if state.attempts != joined_at {
                if let Some((generation, err)) = &state.last_failure {
                    if *generation == state.generation {
                        debug!("Refresh failed while waiting, reusing its error");
                        return Err(err.clone());
                    }
                }
            }
            (state.pair.refresh_token.clone(), state.generation)
        };

        let result = self.run_refresh(refresh_token).await;

        let mut state = self.state.lock();
        state.attempts += 1;
        match result {
            Ok(grant) => {
                state.last_failure = None;
                state.pair.access_token = Some(grant.access_token.clone());
                if let Some(rotated) = grant.refresh_token.filter(|t| !t.is_empty()) {
                    state.pair.refresh_token = Some(rotated);
                }
                state.generation += 1;
                info!("Access token refreshed");
                Ok(grant.access_token)
            }
            Err(err) => {
                state.last_failure = Some((attempt_generation, err.clone()));
                Err(err)
            }
        }
    }

    async fn run_refresh(&self, refresh_token: Option<String>) -> Result<TokenGrant, RefreshError> {
        let provider = self.provider.read().clone().ok_or(RefreshError::NoProvider)?;
        let refresh_token = refresh_token.ok_or(RefreshError::MissingRefreshToken)?;

        let grant = provider.refresh(&refresh_token).await.map_err(|e| {
            warn!("Token refresh failed: {:#}", e);
            RefreshError::Provider(e.to_string())
        })?;
        if grant.access_token.is_empty() {
            return Err(RefreshError::EmptyToken);
        }
        Ok(grant)
    }
}
