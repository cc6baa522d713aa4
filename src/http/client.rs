//! Request executor with bearer injection, retry and token refresh.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;

use super::classify::{FailureKind, ResponseOutcome, classify};
use super::headers::{apply_bearer, header_pair, merge_headers};
use super::request::{MultipartPart, Payload, RequestSpec};
use super::retry::{NextStep, RetryPolicy};
use super::transport::{ReqwestTransport, Transport, TransportBody, TransportRequest};
use crate::auth::{TokenProvider, TokenStore};
use crate::config::ClientConfig;

/// Called with the assembled headers right before every attempt.
pub type RequestInterceptor = Arc<dyn Fn(&mut HeaderMap) + Send + Sync>;

struct Settings {
    default_headers: HeaderMap,
    retry: RetryPolicy,
    auto_refresh: bool,
    interceptor: Option<RequestInterceptor>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    settings: RwLock<Settings>,
    runtime: Handle,
}

/// Authenticated HTTP client.
///
/// Cheap to clone; clones share the transport, token store and settings.
/// Construct one per remote API and hand it to every collaborator.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    tokens: Option<Arc<TokenStore>>,
    runtime: Option<Handle>,
}

impl ApiClientBuilder {
    /// Uses `transport` instead of a [`ReqwestTransport`] built from the config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Shares an existing token store.
    pub fn tokens(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Runtime used by [`ApiClient::execute`]; defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .context("ApiClient must be built inside a tokio runtime or given one")?,
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };
        let default_headers = self.config.default_header_map()?;

        Ok(ApiClient {
            inner: Arc::new(Inner {
                transport,
                tokens: self.tokens.unwrap_or_default(),
                settings: RwLock::new(Settings {
                    default_headers,
                    retry: self.config.retry,
                    auto_refresh: self.config.auto_refresh,
                    interceptor: None,
                }),
                runtime,
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            transport: None,
            tokens: None,
            runtime: None,
        }
    }

    /// Client over a [`ReqwestTransport`] on the current runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        self.inner.tokens.set_provider(Some(provider));
    }

    /// Sets a header sent with every request, replacing any previous value.
    pub fn set_default_header(&self, key: &str, value: &str) -> Result<()> {
        let (name, value) = header_pair(key, value)?;
        self.inner.settings.write().default_headers.insert(name, value);
        Ok(())
    }

    pub fn remove_default_header(&self, key: &str) {
        if let Ok(name) = HeaderName::from_bytes(key.as_bytes()) {
            self.inner.settings.write().default_headers.remove(name);
        }
    }

    pub fn default_headers(&self) -> HeaderMap {
        self.inner.settings.read().default_headers.clone()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.inner.settings.write().retry = policy;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.settings.read().retry.clone()
    }

    pub fn set_auto_refresh(&self, enable: bool) {
        self.inner.settings.write().auto_refresh = enable;
    }

    /// Installs a hook that may edit headers before each attempt.
    ///
    /// A panicking interceptor fails the request with status 0; it is not
    /// retried.
    pub fn set_request_interceptor<F>(&self, interceptor: F)
    where
        F: Fn(&mut HeaderMap) + Send + Sync + 'static,
    {
        self.inner.settings.write().interceptor = Some(Arc::new(interceptor));
    }

    pub fn clear_request_interceptor(&self) {
        self.inner.settings.write().interceptor = None;
    }

    /// Runs `spec` in the background and calls `on_complete` exactly once
    /// with the final outcome. Never blocks the caller.
    pub fn execute<F>(&self, spec: RequestSpec, on_complete: F)
    where
        F: FnOnce(ResponseOutcome) + Send + 'static,
    {
        let client = self.clone();
        self.inner.runtime.spawn(async move {
            let outcome = client.send(spec).await;
            on_complete(outcome);
        });
    }

    /// Runs `spec` through attempts, retries and refresh cycles and returns
    /// the final outcome.
    #[tracing::instrument(skip(self, spec), fields(method = %spec.method, path = %spec.path))]
    pub async fn send(&self, mut spec: RequestSpec) -> ResponseOutcome {
        if let Err(msg) = spec.validate() {
            warn!("Rejecting {} {}: {}", spec.method, spec.path, msg);
            return ResponseOutcome::invalid_request(msg);
        }

        let mut refreshes = 0;
        loop {
            let (token, generation) = self.inner.tokens.snapshot();
            let request = match self.prepare(&spec, token.as_deref()) {
                Ok(request) => request,
                Err(outcome) => return outcome,
            };

            let outcome = self.dispatch(request).await;

            let (policy, auto_refresh) = {
                let settings = self.inner.settings.read();
                (settings.retry.clone(), settings.auto_refresh)
            };
            let can_refresh = auto_refresh && self.inner.tokens.has_provider();

            match policy.next_step(&outcome, spec.attempt, refreshes, can_refresh) {
                NextStep::Done => {
                    debug!(
                        "{} {} finished with status {} after {} attempt(s)",
                        spec.method,
                        spec.path,
                        outcome.status(),
                        spec.attempt + 1
                    );
                    return outcome;
                }
                NextStep::Retry(delay) => {
                    warn!(
                        "{} {}: attempt {}/{} failed ({}), retrying in {}ms...",
                        spec.method,
                        spec.path,
                        spec.attempt + 1,
                        policy.max_retries + 1,
                        outcome.error_message().unwrap_or_default(),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    spec.attempt += 1;
                }
                NextStep::Refresh => {
                    info!("Token refresh needed for status code: {}", outcome.status());
                    if let Err(e) = self.inner.tokens.refresh_after(generation).await {
                        warn!("{} {}: {}", spec.method, spec.path, e);
                        return ResponseOutcome::failure(403, FailureKind::Refresh, e.to_string());
                    }
                    refreshes += 1;
                    spec.attempt += 1;
                }
            }
        }
    }

    /// Assembles the wire request for the next attempt.
    fn prepare(&self, spec: &RequestSpec, token: Option<&str>) -> Result<TransportRequest, ResponseOutcome> {
        let (defaults, interceptor) = {
            let settings = self.inner.settings.read();
            (settings.default_headers.clone(), settings.interceptor.clone())
        };

        let mut headers = merge_headers(&defaults, &spec.headers)
            .map_err(|e| ResponseOutcome::invalid_request(e.to_string()))?;
        apply_bearer(&mut headers, token).map_err(|e| ResponseOutcome::invalid_request(e.to_string()))?;

        if let Some(interceptor) = interceptor {
            panic::catch_unwind(AssertUnwindSafe(|| interceptor(&mut headers))).map_err(|payload| {
                let msg = format!("Request interceptor panicked: {}", panic_message(payload.as_ref()));
                warn!("{}", msg);
                ResponseOutcome::invalid_request(msg)
            })?;
        }

        let body = match (&spec.body, spec.parts.is_empty()) {
            (_, false) => TransportBody::Multipart(spec.parts.clone()),
            (Some(payload), true) => TransportBody::Bytes {
                content_type: payload.content_type.clone(),
                data: payload.data.clone(),
            },
            (None, true) => TransportBody::Empty,
        };

        Ok(TransportRequest {
            method: spec.method.clone(),
            path: spec.path.clone(),
            query: spec.query.clone(),
            headers,
            body,
        })
    }

    /// Runs one blocking transport call off the async workers.
    async fn dispatch(&self, request: TransportRequest) -> ResponseOutcome {
        let transport = Arc::clone(&self.inner.transport);
        match tokio::task::spawn_blocking(move || transport.send(request)).await {
            Ok(result) => classify(result),
            Err(e) => ResponseOutcome::failure(
                0,
                FailureKind::Transport,
                format!("Network error: transport call aborted ({})", e),
            ),
        }
    }

    pub async fn get(&self, path: &str) -> ResponseOutcome {
        self.send(RequestSpec::get(path)).await
    }

    pub async fn get_with_query<K: AsRef<str>, V: AsRef<str>>(&self, path: &str, params: &[(K, V)]) -> ResponseOutcome {
        let spec = params
            .iter()
            .fold(RequestSpec::get(path), |spec, (k, v)| spec.query(k.as_ref(), v.as_ref()));
        self.send(spec).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> ResponseOutcome {
        self.send_json(Method::POST, path, value).await
    }

    pub async fn post_form<K: AsRef<str>, V: AsRef<str>>(&self, path: &str, params: &[(K, V)]) -> ResponseOutcome {
        self.send(RequestSpec::form(path, params)).await
    }

    pub async fn post_multipart(&self, path: &str, parts: Vec<MultipartPart>) -> ResponseOutcome {
        self.send(RequestSpec::multipart(path, parts)).await
    }

    pub async fn post_raw(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> ResponseOutcome {
        self.send(RequestSpec::new(Method::POST, path).body(Payload::new(content_type, body)))
            .await
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> ResponseOutcome {
        self.send_json(Method::PUT, path, value).await
    }

    pub async fn put_raw(&self, path: &str, body: impl Into<Vec<u8>>, content_type: &str) -> ResponseOutcome {
        self.send(RequestSpec::new(Method::PUT, path).body(Payload::new(content_type, body)))
            .await
    }

    pub async fn delete(&self, path: &str) -> ResponseOutcome {
        self.send(RequestSpec::delete(path)).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> ResponseOutcome {
        self.send_json(Method::PATCH, path, value).await
    }

    async fn send_json<T: Serialize + ?Sized>(&self, method: Method, path: &str, value: &T) -> ResponseOutcome {
        match RequestSpec::json(method, path, value) {
            Ok(spec) => self.send(spec).await,
            Err(e) => ResponseOutcome::invalid_request(format!("{:#}", e)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
