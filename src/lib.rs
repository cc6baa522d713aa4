//! Authenticated HTTP client with retry and coordinated token refresh.
//!
//! [`http::ApiClient`] merges default headers, injects the bearer token,
//! retries transient failures and runs a refresh cycle when the server
//! rejects the access token. Tokens live in an [`auth::TokenStore`] shared by
//! every clone of the client.

pub mod auth;
pub mod config;
pub mod http;
pub mod session;

pub use auth::{HttpTokenProvider, NoRefresh, TokenPair, TokenProvider, TokenStore};
pub use config::{AuthEndpoints, ClientConfig};
pub use http::{ApiClient, RequestSpec, ResponseOutcome, RetryPolicy};
pub use session::{LoginResult, UserSession};
