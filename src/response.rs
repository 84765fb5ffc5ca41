//! Translates decisions into the HTTP response contract.
//!
//! Every response carries the informational `X-RateLimit-*` headers. A
//! rejection additionally carries `Retry-After`, `X-RateLimit-Reason` and a
//! JSON body, with status 429.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;

use crate::ratelimit::{RateLimitDecision, RejectionReason, Scope};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_SCOPE: HeaderName = HeaderName::from_static("x-ratelimit-scope");
pub const X_RATELIMIT_REASON: HeaderName = HeaderName::from_static("x-ratelimit-reason");

/// Machine-readable error code in rejection bodies.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Headers for any decision, allowed or not.
pub fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply_headers(decision, &mut headers);
    headers
}

/// Insert the rate limit headers into an existing header map, replacing
/// any previous values.
pub fn apply_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_epoch_seconds()),
    );
    if let Ok(scope) = HeaderValue::from_str(&decision.scope.to_string()) {
        headers.insert(X_RATELIMIT_SCOPE, scope);
    }

    if let Some(retry_after) = decision.retry_after_seconds {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    if let Some(reason) = decision.reason {
        headers.insert(X_RATELIMIT_REASON, HeaderValue::from_static(reason.as_str()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionBody {
    pub error: RejectionError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionError {
    pub code: &'static str,
    pub message: String,
    pub scope: Scope,
    pub reason: RejectionReason,
    pub retry_after: u64,
}

/// A complete 429 response, ready for the response-writing layer.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RejectionBody,
}

impl RateLimitRejection {
    /// Build the rejection for a decision, or `None` if it was allowed.
    pub fn from_decision(decision: &RateLimitDecision) -> Option<Self> {
        if decision.allowed {
            return None;
        }

        let reason = decision.reason.unwrap_or(RejectionReason::WindowExceeded);
        let retry_after = decision.retry_after_seconds.unwrap_or(1);
        let message = match reason {
            RejectionReason::WindowExceeded => format!(
                "Rate limit of {} requests per {} exceeded. Retry after {} seconds.",
                decision.limit, decision.scope, retry_after
            ),
            RejectionReason::BurstExceeded => format!(
                "Too many requests in a short burst. Retry after {} seconds.",
                retry_after
            ),
        };

        let mut headers = rate_limit_headers(decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(X_RATELIMIT_REASON, HeaderValue::from_static(reason.as_str()));
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Some(Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: RejectionBody {
                error: RejectionError {
                    code: RATE_LIMIT_EXCEEDED,
                    message,
                    scope: decision.scope,
                    reason,
                    retry_after,
                },
            },
        })
    }

    pub fn body_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimiterBackend, Window};
    use chrono::{DateTime, Utc};

    fn decision(allowed: bool, reason: Option<RejectionReason>) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            remaining: if allowed { 7 } else { 0 },
            limit: 60,
            scope: if reason == Some(RejectionReason::BurstExceeded) {
                Scope::Burst
            } else {
                Scope::Window(Window::Minute)
            },
            reset_at: DateTime::<Utc>::from_timestamp_millis(1_700_000_030_500).unwrap(),
            retry_after_seconds: (!allowed).then_some(31),
            reason,
            backend: LimiterBackend::Distributed,
        }
    }

    #[test]
    fn test_allowed_headers() {
        let headers = rate_limit_headers(&decision(true, None));

        assert_eq!(headers[&X_RATELIMIT_LIMIT], "60");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "7");
        assert_eq!(headers[&X_RATELIMIT_RESET], "1700000031");
        assert_eq!(headers[&X_RATELIMIT_SCOPE], "minute");
        assert!(headers.get(RETRY_AFTER).is_none());
        assert!(headers.get(&X_RATELIMIT_REASON).is_none());
        assert!(RateLimitRejection::from_decision(&decision(true, None)).is_none());
    }

    #[test]
    fn test_window_rejection() {
        let rejection =
            RateLimitRejection::from_decision(&decision(false, Some(RejectionReason::WindowExceeded)))
                .unwrap();

        assert_eq!(rejection.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejection.headers[RETRY_AFTER], "31");
        assert_eq!(rejection.headers[&X_RATELIMIT_REASON], "window_exceeded");
        assert_eq!(rejection.headers[&X_RATELIMIT_REMAINING], "0");

        let body: serde_json::Value =
            serde_json::from_str(&rejection.body_json().unwrap()).unwrap();
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["scope"], "minute");
        assert_eq!(body["error"]["reason"], "window_exceeded");
        assert_eq!(body["error"]["retry_after"], 31);
    }

    #[test]
    fn test_burst_rejection() {
        let rejection =
            RateLimitRejection::from_decision(&decision(false, Some(RejectionReason::BurstExceeded)))
                .unwrap();

        assert_eq!(rejection.headers[&X_RATELIMIT_SCOPE], "burst");
        assert_eq!(rejection.headers[&X_RATELIMIT_REASON], "burst_exceeded");
        assert!(rejection.body.error.message.contains("burst"));
    }
}
