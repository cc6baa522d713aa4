//! HTTP client module with bearer auth, retry logic and error classification.

mod classify;
mod client;
mod headers;
mod request;
mod retry;
mod transport;

pub use classify::{FailureKind, ResponseOutcome, classify, extract_error_message, status_message};
pub use client::{ApiClient, ApiClientBuilder, RequestInterceptor};
pub use headers::{InvalidHeader, apply_bearer, header_pair, merge_headers};
pub use request::{
    FORM_CONTENT_TYPE, JSON_CONTENT_TYPE, MultipartPart, Payload, RequestSpec, SUPPORTED_METHODS,
    is_origin_relative, is_supported_method,
};
pub use retry::{MAX_RETRIES, NextStep, RETRY_DELAY_MS, RETRYABLE_STATUS_CODES, RetryPolicy};
pub use transport::{
    RawResponse, ReqwestTransport, Transport, TransportBody, TransportError, TransportRequest,
};

#[cfg(test)]
pub use transport::MockTransport;
