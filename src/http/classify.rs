//! Normalizes transport results into [`ResponseOutcome`] values.

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

use super::transport::{RawResponse, TransportError};

/// Top-level string fields searched for a server supplied error message, in
/// priority order.
const ERROR_FIELDS: [&str; 5] = ["error", "message", "detail", "error_description", "msg"];

/// Fields searched inside a nested `"error": { ... }` object.
const NESTED_ERROR_FIELDS: [&str; 3] = ["message", "detail", "description"];

/// Why an outcome is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No HTTP response was obtained (status 0)
    Transport,
    /// A response arrived with a status outside 200..300
    Http,
    /// The token refresh cycle failed (synthetic 403)
    Refresh,
    /// The request was malformed and never dispatched (status 0)
    InvalidRequest,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Http => write!(f, "http"),
            FailureKind::Refresh => write!(f, "refresh"),
            FailureKind::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

/// Normalized result of one attempt. Immutable once built.
#[derive(Debug, Clone)]
pub struct ResponseOutcome {
    status: u16,
    body: String,
    headers: HeaderMap,
    error_message: Option<String>,
    kind: Option<FailureKind>,
}

impl ResponseOutcome {
    /// Failure with no HTTP exchange behind it.
    pub(crate) fn failure(status: u16, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status,
            body: String::new(),
            headers: HeaderMap::new(),
            error_message: Some(message.into()),
            kind: Some(kind),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::failure(0, FailureKind::InvalidRequest, message)
    }

    /// Status code; 0 when no HTTP response was obtained.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True iff the status is in 200..300.
    pub fn is_success(&self) -> bool {
        self.kind.is_none()
    }

    /// Human readable error; present iff the outcome is a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn kind(&self) -> Option<FailureKind> {
        self.kind
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))
    }
}

/// Maps a raw transport result into an outcome.
pub fn classify(result: Result<RawResponse, TransportError>) -> ResponseOutcome {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            return ResponseOutcome::failure(
                0,
                FailureKind::Transport,
                format!("Network error: {}", e),
            );
        }
    };

    let success = (200..300).contains(&response.status);
    let (error_message, kind) = if success {
        (None, None)
    } else {
        let fallback = status_message(response.status);
        (
            Some(extract_error_message(&response.body).unwrap_or(fallback)),
            Some(FailureKind::Http),
        )
    };

    ResponseOutcome {
        status: response.status,
        body: response.body,
        headers: response.headers,
        error_message,
        kind,
    }
}

/// Static message for a failed status code.
pub fn status_message(status: u16) -> String {
    match status {
        400 => "Bad request".to_string(),
        401 => "Invalid credentials".to_string(),
        403 => "Access forbidden".to_string(),
        404 => "Login endpoint not found".to_string(),
        429 => "Too many login attempts".to_string(),
        500 => "Server error".to_string(),
        other => format!("Error {}", other),
    }
}

/// Best-effort extraction of an error message embedded in a JSON body.
///
/// Returns `None` when the body is not JSON or carries no recognizable,
/// non-empty error field.
pub fn extract_error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;

    let top_level = ERROR_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(Value::as_str))
        .find(|msg| !msg.is_empty());
    if let Some(msg) = top_level {
        return Some(msg.to_string());
    }

    let nested = object.get("error")?.as_object()?;
    NESTED_ERROR_FIELDS
        .iter()
        .filter_map(|field| nested.get(*field).and_then(Value::as_str))
        .find(|msg| !msg.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: u16, body: &str) -> ResponseOutcome {
        classify(Ok(RawResponse::new(status, body)))
    }

    #[test]
    fn test_success_range() {
        for status in [200, 201, 204, 299] {
            let o = outcome(status, "");
            assert!(o.is_success(), "status {}", status);
            assert!(o.error_message().is_none());
        }
        for status in [199, 300, 302, 404] {
            assert!(!outcome(status, "").is_success(), "status {}", status);
        }
    }

    #[test]
    fn test_transport_error_maps_to_status_zero() {
        let o = classify(Err(TransportError::Connect("refused".to_string())));
        assert_eq!(o.status(), 0);
        assert!(!o.is_success());
        assert_eq!(o.kind(), Some(FailureKind::Transport));
        assert!(o.error_message().unwrap().starts_with("Network error: "));
    }

    #[test]
    fn test_status_table() {
        assert_eq!(status_message(400), "Bad request");
        assert_eq!(status_message(401), "Invalid credentials");
        assert_eq!(status_message(403), "Access forbidden");
        assert_eq!(status_message(404), "Login endpoint not found");
        assert_eq!(status_message(429), "Too many login attempts");
        assert_eq!(status_message(500), "Server error");
        assert_eq!(status_message(418), "Error 418");
    }

    #[test]
    fn test_nested_error_message() {
        let o = outcome(401, r#"{"error":{"message":"Bad password"}}"#);
        assert_eq!(o.error_message(), Some("Bad password"));
        assert_eq!(o.kind(), Some(FailureKind::Http));
    }

    #[test]
    fn test_empty_object_keeps_table_message() {
        let o = outcome(401, "{}");
        assert_eq!(o.error_message(), Some("Invalid credentials"));
    }

    #[test]
    fn test_unparseable_body_keeps_table_message() {
        let o = outcome(500, "<html>oops</html>");
        assert_eq!(o.error_message(), Some("Server error"));
        assert_eq!(o.body(), "<html>oops</html>");
    }

    #[test]
    fn test_top_level_field_priority() {
        let body = r#"{"msg":"m","detail":"d","message":"first"}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("first"));

        let body = r#"{"error":"","error_description":"expired"}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("expired"));
    }

    #[test]
    fn test_nested_field_order() {
        let body = r#"{"error":{"description":"desc","detail":"det"}}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("det"));
    }

    #[test]
    fn test_non_string_fields_are_ignored() {
        assert_eq!(extract_error_message(r#"{"error":42,"message":null}"#), None);
        assert_eq!(extract_error_message(r#"["error"]"#), None);
    }

    #[test]
    fn test_json_helper() {
        let o = outcome(200, r#"{"id":7}"#);
        let value: serde_json::Value = o.json().unwrap();
        assert_eq!(value["id"], 7);

        let o = outcome(200, "nope");
        assert!(o.json::<serde_json::Value>().is_err());
    }
}
