//! Retry policy and the per-attempt decision of what happens next.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::classify::{FailureKind, ResponseOutcome};

/// Default number of retries after the first attempt.
pub const MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Status codes retried by default.
pub const RETRYABLE_STATUS_CODES: [u16; 3] = [401, 403, 503];

/// Retry configuration, adjustable at runtime through the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retryable_status_codes: BTreeSet<u16>,
    /// Upper bound on refresh cycles per request; `None` means unbounded.
    pub max_refreshes: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_delay_ms: RETRY_DELAY_MS,
            retryable_status_codes: RETRYABLE_STATUS_CODES.into_iter().collect(),
            max_refreshes: None,
        }
    }
}

/// What the executor does after classifying an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Deliver the outcome.
    Done,
    /// Wait, then try again with the attempt count bumped.
    Retry(Duration),
    /// Refresh the access token, then try again.
    Refresh,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64, status_codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            retryable_status_codes: status_codes.into_iter().collect(),
            max_refreshes: None,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// A failure is retryable while budget remains and its status is listed.
    pub fn should_retry(&self, status: u16, attempt: u32) -> bool {
        attempt < self.max_retries && self.retryable_status_codes.contains(&status)
    }

    /// Decides the next step for `outcome`.
    ///
    /// `can_refresh` is true when auto refresh is on and a token provider is
    /// configured. A 401/403 then goes to the refresh cycle whatever the
    /// remaining retry budget, bounded only by `max_refreshes`.
    pub fn next_step(
        &self,
        outcome: &ResponseOutcome,
        attempt: u32,
        refreshes: u32,
        can_refresh: bool,
    ) -> NextStep {
        match outcome.kind() {
            None => return NextStep::Done,
            Some(FailureKind::InvalidRequest) | Some(FailureKind::Refresh) => return NextStep::Done,
            Some(FailureKind::Transport) | Some(FailureKind::Http) => {}
        }

        let status = outcome.status();
        let refresh_budget = self.max_refreshes.is_none_or(|max| refreshes < max);
        if can_refresh && refresh_budget && matches!(status, 401 | 403) {
            return NextStep::Refresh;
        }

        if self.should_retry(status, attempt) {
            NextStep::Retry(self.retry_delay())
        } else {
            NextStep::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::classify::classify;
    use crate::http::transport::{RawResponse, TransportError};

    fn http(status: u16) -> ResponseOutcome {
        classify(Ok(RawResponse::new(status, "")))
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay(), Duration::from_millis(1000));
        assert_eq!(
            policy.retryable_status_codes,
            BTreeSet::from([401, 403, 503])
        );
        assert_eq!(policy.max_refreshes, None);
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(503, 0));
        assert!(policy.should_retry(503, 2));
        assert!(!policy.should_retry(503, 3));
        assert!(!policy.should_retry(500, 0));
    }

    #[test]
    fn test_success_is_done() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_step(&http(200), 0, 0, true), NextStep::Done);
    }

    #[test]
    fn test_retryable_status_waits() {
        let policy = RetryPolicy::new(2, 25, [503]);
        assert_eq!(
            policy.next_step(&http(503), 1, 0, false),
            NextStep::Retry(Duration::from_millis(25))
        );
        assert_eq!(policy.next_step(&http(503), 2, 0, false), NextStep::Done);
        assert_eq!(policy.next_step(&http(404), 0, 0, false), NextStep::Done);
    }

    #[test]
    fn test_unauthorized_prefers_refresh_even_without_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_step(&http(401), 0, 0, true), NextStep::Refresh);
        assert_eq!(policy.next_step(&http(403), 10, 10, true), NextStep::Refresh);
    }

    #[test]
    fn test_unauthorized_without_provider_plain_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_step(&http(401), 0, 0, false),
            NextStep::Retry(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_max_refreshes_falls_back_to_retry_rules() {
        let mut policy = RetryPolicy::new(1, 0, [401]);
        policy.max_refreshes = Some(1);
        assert_eq!(policy.next_step(&http(401), 0, 0, true), NextStep::Refresh);
        assert_eq!(policy.next_step(&http(401), 0, 1, true), NextStep::Retry(Duration::ZERO));
        assert_eq!(policy.next_step(&http(401), 1, 1, true), NextStep::Done);
    }

    #[test]
    fn test_transport_error_not_retried_by_default() {
        let policy = RetryPolicy::default();
        let outcome = classify(Err(TransportError::Timeout("read".to_string())));
        assert_eq!(policy.next_step(&outcome, 0, 0, true), NextStep::Done);

        let policy = RetryPolicy::new(3, 0, [0]);
        assert_eq!(policy.next_step(&outcome, 0, 0, true), NextStep::Retry(Duration::ZERO));
    }

    #[test]
    fn test_invalid_request_is_final() {
        let policy = RetryPolicy::new(3, 0, [0]);
        let outcome = ResponseOutcome::invalid_request("bad");
        assert_eq!(policy.next_step(&outcome, 0, 0, true), NextStep::Done);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert!(policy.retryable_status_codes.contains(&503));
    }
}
