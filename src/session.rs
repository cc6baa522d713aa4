//! Login/logout on top of [`ApiClient`].

use log::{info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::AuthEndpoints;
use crate::http::ApiClient;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    is_verify: bool,
}

/// Result of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub success: bool,
    pub message: String,
}

impl LoginResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    logged_in: bool,
    username: Option<String>,
    verified: bool,
}

/// User session bound to one [`ApiClient`] and its token store.
#[derive(Clone)]
pub struct UserSession {
    client: ApiClient,
    login_path: String,
    state: Arc<Mutex<SessionState>>,
}

impl UserSession {
    pub fn new(client: ApiClient, endpoints: &AuthEndpoints) -> Self {
        Self {
            client,
            login_path: endpoints.login_path.clone(),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Posts the credentials and installs the returned tokens on success.
    ///
    /// Any 2xx answer with a JSON object body counts as a login, even one
    /// without tokens; missing fields are stored as empty.
    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> LoginResult {
        let body = serde_json::json!({ "email": username, "password": password });
        let outcome = self.client.post_json(&self.login_path, &body).await;
        if !outcome.is_success() {
            let message = outcome.error_message().unwrap_or_default().to_string();
            warn!("Login failed for {}: {}", username, message);
            return LoginResult::failed(message);
        }

        let response: LoginResponse = match outcome.json() {
            Ok(response) => response,
            Err(e) => return LoginResult::failed(e.to_string()),
        };

        self.client
            .tokens()
            .set_tokens(response.access_token, response.refresh_token);
        {
            let mut state = self.state.lock();
            state.logged_in = true;
            state.username = Some(username.to_string());
            state.verified = response.is_verify;
        }
        info!("Logged in as {}", username);

        LoginResult {
            success: true,
            message: "Login successful".to_string(),
        }
    }

    /// Callback form of [`login`](Self::login). Returns immediately; the
    /// callback runs once on the client's runtime.
    pub fn login_with<F>(&self, username: &str, password: &str, on_complete: F)
    where
        F: FnOnce(bool, String) + Send + 'static,
    {
        let session = self.clone();
        let username = username.to_string();
        let password = password.to_string();
        self.client.runtime().spawn(async move {
            let result = session.login(&username, &password).await;
            on_complete(result.success, result.message);
        });
    }

    /// Forgets tokens and user details. No network call is made.
    pub fn logout(&self) {
        self.client.tokens().clear();
        *self.state.lock() = SessionState::default();
        info!("Logged out");
    }

    /// True between a successful [`login`](Self::login) and [`logout`](Self::logout).
    pub fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    pub fn username(&self) -> Option<String> {
        self.state.lock().username.clone()
    }

    pub fn is_verified(&self) -> bool {
        self.state.lock().verified
    }
}
