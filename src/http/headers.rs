//! Header merging and bearer token injection.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::fmt;

/// A header name or value that cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHeader {
    pub name: String,
    pub reason: String,
}

impl fmt::Display for InvalidHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid header {:?}: {}", self.name, self.reason)
    }
}

impl std::error::Error for InvalidHeader {}

/// Parses a header pair.
pub fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), InvalidHeader> {
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok((header_name, header_value))
}

/// Builds the header set for one attempt: `defaults` overridden by
/// `overrides` on case-insensitive key collision. `defaults` is not touched.
pub fn merge_headers(
    defaults: &HeaderMap,
    overrides: &[(String, String)],
) -> Result<HeaderMap, InvalidHeader> {
    let mut merged = defaults.clone();
    for (name, value) in overrides {
        let (name, value) = header_pair(name, value)?;
        merged.insert(name, value);
    }
    Ok(merged)
}

/// Drops any existing `Authorization` header and, if `token` is non-empty,
/// installs `Authorization: Bearer <token>`.
pub fn apply_bearer(headers: &mut HeaderMap, token: Option<&str>) -> Result<(), InvalidHeader> {
    headers.remove(AUTHORIZATION);
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| InvalidHeader {
        name: AUTHORIZATION.to_string(),
        reason: e.to_string(),
    })?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}
