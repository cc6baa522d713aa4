//! Blocking transport seam: one HTTP exchange per call.
//!
//! The executor never talks to the network directly. It hands a fully
//! assembled [`TransportRequest`] to a [`Transport`] from a blocking worker
//! thread and classifies whatever comes back. [`ReqwestTransport`] is the
//! production implementation; tests substitute `MockTransport`.

use log::debug;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use reqwest::blocking::{Client, multipart};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::fmt;
use std::time::Duration;
use url::Url;

use super::request::{MultipartPart, is_origin_relative};
use crate::config::ClientConfig;

/// Body of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportBody {
    #[default]
    Empty,
    /// Raw bytes sent with the given content type.
    Bytes { content_type: String, data: Vec<u8> },
    /// Multipart form; the transport picks the boundary.
    Multipart(Vec<MultipartPart>),
}

/// A request exactly as it should go out on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: TransportBody,
}

impl TransportRequest {
    /// Path with the url-encoded query string appended.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.query)
            .finish();
        format!("{}?{}", self.path, query)
    }

    /// Returns a header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// What the server sent back for one attempt.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// No HTTP response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// DNS failure, refused connection, TLS handshake failure
    Connect(String),
    /// Connect or read timeout elapsed
    Timeout(String),
    /// Anything else that prevented a response (bad URL, body read failure)
    Request(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Could not connect to server ({})", msg),
            TransportError::Timeout(msg) => write!(f, "Request timed out ({})", msg),
            TransportError::Request(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout(error.to_string())
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

/// Performs one blocking HTTP exchange.
///
/// Implementations are called from a blocking worker thread and may take as
/// long as their own timeouts allow.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
struct TransportSettings {
    base_url: Url,
    verify_tls: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    user_agent: String,
}

/// [`Transport`] backed by `reqwest::blocking`.
///
/// The underlying client is built on first use, on the worker thread, and
/// rebuilt after any settings change.
pub struct ReqwestTransport {
    settings: RwLock<TransportSettings>,
    client: Mutex<Option<Client>>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let settings = TransportSettings {
            base_url: config.base_url()?,
            verify_tls: config.verify_tls,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            user_agent: config.user_agent.clone(),
        };
        debug!("Transport targets {}", settings.base_url);
        Ok(Self {
            settings: RwLock::new(settings),
            client: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> Url {
        self.settings.read().base_url.clone()
    }

    /// Changes connection and read timeouts for subsequent attempts.
    pub fn set_timeouts(&self, connect_timeout: Duration, read_timeout: Duration) {
        {
            let mut settings = self.settings.write();
            settings.connect_timeout = connect_timeout;
            settings.read_timeout = read_timeout;
        }
        self.client.lock().take();
    }

    /// Enables or disables server certificate verification.
    pub fn set_verify_tls(&self, verify: bool) {
        self.settings.write().verify_tls = verify;
        self.client.lock().take();
    }

    fn client(&self) -> Result<Client, TransportError> {
        let mut cached = self.client.lock();
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let settings = self.settings.read().clone();
        let client = Client::builder()
            .user_agent(settings.user_agent)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to build HTTP client: {}", e)))?;
        *cached = Some(client.clone());
        Ok(client)
    }

    /// Resolves `request.path` against the base URL. The path only ever
    /// replaces the path component; scheme, host and port stay configured.
    fn url_for(&self, request: &TransportRequest) -> Result<Url, TransportError> {
        if !is_origin_relative(&request.path) {
            return Err(TransportError::Request(format!(
                "Invalid path {:?}: must start with a single '/'",
                request.path
            )));
        }

        let mut url = self.base_url();
        let (path, query) = match request.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (request.path.as_str(), None),
        };
        url.set_path(path);
        url.set_query(query);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        let client = self.client()?;
        let url = self.url_for(&request)?;
        debug!("{} {}", request.method, url);

        let TransportRequest {
            method,
            mut headers,
            body,
            ..
        } = request;

        let builder = match body {
            TransportBody::Empty => client.request(method, url).headers(headers),
            TransportBody::Bytes { content_type, data } => {
                let value = HeaderValue::from_str(&content_type).map_err(|e| {
                    TransportError::Request(format!("Invalid content type {:?}: {}", content_type, e))
                })?;
                headers.insert(CONTENT_TYPE, value);
                client.request(method, url).headers(headers).body(data)
            }
            TransportBody::Multipart(parts) => {
                headers.remove(CONTENT_TYPE);
                client
                    .request(method, url)
                    .headers(headers)
                    .multipart(multipart_form(parts)?)
            }
        };

        let response = builder.send()?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text()?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn multipart_form(parts: Vec<MultipartPart>) -> Result<multipart::Form, TransportError> {
    let mut form = multipart::Form::new();
    for part in parts {
        let mut field = multipart::Part::bytes(part.content);
        if let Some(filename) = part.filename {
            field = field.file_name(filename);
        }
        if let Some(content_type) = part.content_type {
            field = field.mime_str(&content_type).map_err(|e| {
                TransportError::Request(format!("Invalid part content type {:?}: {}", content_type, e))
            })?;
        }
        form = form.part(part.name, field);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: &[(&str, &str)]) -> TransportRequest {
        TransportRequest {
            method: Method::GET,
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: HeaderMap::new(),
            body: TransportBody::Empty,
        }
    }

    fn transport_for(url: &str) -> ReqwestTransport {
        let config = ClientConfig::from_base_url(url).unwrap();
        ReqwestTransport::new(&config).unwrap()
    }

    #[test]
    fn test_path_and_query_without_params() {
        assert_eq!(request("/items", &[]).path_and_query(), "/items");
    }

    #[test]
    fn test_path_and_query_encodes_params() {
        let req = request("/search", &[("q", "a b"), ("page", "2")]);
        assert_eq!(req.path_and_query(), "/search?q=a+b&page=2");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Connect("refused".to_string());
        assert!(err.to_string().contains("Could not connect to server"));

        let err = TransportError::Timeout("read".to_string());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_send_get_with_query() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/items?page=1&per_page=10")
            .match_header("x-trace", "abc")
            .with_status(200)
            .with_header("x-total", "2")
            .with_body(r#"["a","b"]"#)
            .create();

        let transport = transport_for(&server.url());
        let mut req = request("/items", &[("page", "1"), ("per_page", "10")]);
        req.headers
            .insert("x-trace", HeaderValue::from_static("abc"));

        let response = transport.send(req).unwrap();

        mock.assert();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"["a","b"]"#);
        assert_eq!(response.headers.get("x-total").unwrap(), "2");
    }

    #[test]
    fn test_send_bytes_sets_content_type() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/echo")
            .match_header("content-type", "text/plain")
            .match_body("hello")
            .with_status(201)
            .create();

        let transport = transport_for(&server.url());
        let mut req = request("/echo", &[]);
        req.method = Method::POST;
        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        req.body = TransportBody::Bytes {
            content_type: "text/plain".to_string(),
            data: b"hello".to_vec(),
        };

        let response = transport.send(req).unwrap();

        mock.assert();
        assert_eq!(response.status, 201);
    }

    #[test]
    fn test_send_multipart_uses_generated_boundary() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/upload")
            .match_header(
                "content-type",
                mockito::Matcher::Regex("^multipart/form-data; boundary=".to_string()),
            )
            .match_body(mockito::Matcher::Regex("avatar.png".to_string()))
            .with_status(200)
            .create();

        let transport = transport_for(&server.url());
        let mut req = request("/upload", &[]);
        req.method = Method::POST;
        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        req.body = TransportBody::Multipart(vec![
            MultipartPart::file("avatar", "avatar.png", b"PNG".to_vec()),
        ]);

        let response = transport.send(req).unwrap();

        mock.assert();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_path_never_selects_another_host() {
        let mut home = mockito::Server::new();
        let mut other = mockito::Server::new();
        let stolen = other.mock("GET", "/steal").expect(0).create();
        let home_mock = home.mock("GET", mockito::Matcher::Any).expect(0).create();

        let transport = transport_for(&home.url());
        let other_authority = other.host_with_port();
        for path in [format!("//{}/steal", other_authority), format!("{}/steal", other.url())] {
            let mut req = request(&path, &[]);
            req.headers
                .insert("authorization", HeaderValue::from_static("Bearer secret"));

            let err = transport.send(req).unwrap_err();
            assert!(matches!(err, TransportError::Request(_)), "{}", path);
        }

        stolen.assert();
        home_mock.assert();
    }

    #[test]
    fn test_query_in_path_is_kept() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/items?sort=asc&page=3")
            .with_status(200)
            .create();

        let transport = transport_for(&server.url());
        let response = transport
            .send(request("/items?sort=asc", &[("page", "3")]))
            .unwrap();

        mock.assert();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_send_connection_refused_is_transport_error() {
        // Port 9 (discard) is not expected to accept HTTP connections locally.
        let transport = transport_for("http://127.0.0.1:9");
        let result = transport.send(request("/", &[]));
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_changes_drop_cached_client() {
        let transport = transport_for("http://127.0.0.1:1");
        transport.client().unwrap();
        assert!(transport.client.lock().is_some());

        transport.set_verify_tls(false);
        assert!(transport.client.lock().is_none());

        transport.client().unwrap();
        transport.set_timeouts(Duration::from_secs(1), Duration::from_secs(2));
        assert!(transport.client.lock().is_none());
        assert_eq!(transport.settings.read().read_timeout, Duration::from_secs(2));
    }
}
