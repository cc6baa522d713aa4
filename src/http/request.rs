//! Logical request descriptions.

use anyhow::{Context, Result};
use reqwest::Method;
use serde::Serialize;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub const SUPPORTED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
];

/// Returns true for the verbs the executor knows how to dispatch.
pub fn is_supported_method(method: &Method) -> bool {
    SUPPORTED_METHODS.contains(method)
}

/// True for `/x` style paths. Rejects `//host`, `/\host` and absolute URLs,
/// which would otherwise pick another authority than the configured one.
pub fn is_origin_relative(path: &str) -> bool {
    let mut chars = path.chars();
    chars.next() == Some('/') && !matches!(chars.next(), Some('/') | Some('\\'))
}

/// A raw body together with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value).context("Failed to serialize JSON body")?;
        Ok(Self::new(JSON_CONTENT_TYPE, data))
    }

    /// `application/x-www-form-urlencoded` body from key/value pairs.
    pub fn form<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();
        Self::new(FORM_CONTENT_TYPE, encoded)
    }
}

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub content: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: value.into().into_bytes(),
            filename: None,
            content_type: None,
        }
    }

    pub fn file(name: impl Into<String>, filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
            filename: Some(filename.into()),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A logical request, kept for the lifetime of one operation including all of
/// its retry attempts.
///
/// Headers are plain strings here; they are validated when an attempt is
/// assembled so a bad header surfaces as a failed outcome instead of a panic
/// at build time.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Payload>,
    pub parts: Vec<MultipartPart>,
    /// Attempts already made; bumped before every retry.
    pub attempt: u32,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            parts: Vec::new(),
            attempt: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Request with a JSON body.
    pub fn json<T: Serialize + ?Sized>(method: Method, path: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(method, path).body(Payload::json(value)?))
    }

    /// POST with an url-encoded form body.
    pub fn form<K: AsRef<str>, V: AsRef<str>>(path: impl Into<String>, pairs: &[(K, V)]) -> Self {
        Self::new(Method::POST, path).body(Payload::form(pairs))
    }

    /// POST with a multipart body.
    pub fn multipart(path: impl Into<String>, parts: Vec<MultipartPart>) -> Self {
        let mut spec = Self::new(Method::POST, path);
        spec.parts = parts;
        spec
    }

    /// Adds a per-call header. A later header with the same name
    /// (case-insensitive) replaces an earlier one.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        self.headers.push((key, value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, payload: Payload) -> Self {
        self.body = Some(payload);
        self
    }

    pub fn part(mut self, part: MultipartPart) -> Self {
        self.parts.push(part);
        self
    }

    /// Checks the request before any network activity.
    ///
    /// Returns a description of the problem for unsupported verbs, for paths
    /// that could name another host and for requests carrying both a raw body
    /// and multipart parts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !is_supported_method(&self.method) {
            return Err(format!("Unknown method: {}", self.method));
        }
        if !is_origin_relative(&self.path) {
            return Err(format!("Invalid path {:?}: must start with a single '/'", self.path));
        }
        if self.body.is_some() && !self.parts.is_empty() {
            return Err("Request cannot carry both a body and multipart parts".to_string());
        }
        Ok(())
    }
}
