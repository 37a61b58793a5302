//! Error taxonomy shared by every platform connector.
//!
//! Remote failures are classified at the connector boundary into one of a
//! small set of [`ErrorCode`]s. Each code carries a retry policy, and rate
//! limit errors may carry a suggested `retry_after` delay.
//!
//! Classification is table-driven: a platform supplies a static
//! [`ErrorTable`] of status-code and body-pattern rules, and the shared
//! [`ErrorTable::classify`] does the rest. Adding a platform never adds
//! control flow here.
//!
//! | Code | Retryable | Meaning |
//! |------|-----------|---------|
//! | `rate_limit` | yes | Remote quota exhausted, honor `retry_after` |
//! | `auth_error` | no | Credentials missing or invalid |
//! | `permission_error` | no | Authenticated but insufficient scope |
//! | `not_found` | no | Resource does not exist |
//! | `network_error` | yes | Transient connectivity failure |
//! | `api_error` | yes | Generic remote failure |
//! | `cancelled` | no | Local cancellation (shutdown, disable) |

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classified failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimit,
    AuthError,
    PermissionError,
    NotFound,
    NetworkError,
    ApiError,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::AuthError => "auth_error",
            ErrorCode::PermissionError => "permission_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::ApiError => "api_error",
            ErrorCode::Cancelled => "cancelled",
        }
    }

    /// Default retry policy for this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimit | ErrorCode::NetworkError | ErrorCode::ApiError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified connector failure.
///
/// This is the error shape that crosses the connector boundary:
/// `{platform, code, message, retryable, retry_after?}`. The orchestrator
/// decides between retry, disable, and continue purely from these fields.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{platform} {code}: {message}")]
pub struct ConnectorError {
    pub platform: String,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub retry_after: Option<Duration>,
}

impl ConnectorError {
    pub fn new(platform: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn auth(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(platform, ErrorCode::AuthError, message)
    }

    pub fn network(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(platform, ErrorCode::NetworkError, message)
    }

    pub fn api(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(platform, ErrorCode::ApiError, message)
    }

    pub fn cancelled(platform: impl Into<String>) -> Self {
        Self::new(platform, ErrorCode::Cancelled, "operation cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    /// Map a transport-level `reqwest` failure.
    ///
    /// Anything that never produced an HTTP status is a network error;
    /// body decoding failures are generic API errors.
    pub fn from_transport(platform: &str, err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::api(platform, format!("invalid response body: {}", err))
        } else {
            Self::network(platform, err.to_string())
        }
    }
}

mod opt_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

/// What a single classification rule matches on.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// Exact HTTP status.
    Status(u16),
    /// Inclusive HTTP status range.
    StatusRange(u16, u16),
    /// HTTP status together with a case-insensitive body substring.
    StatusBody(u16, &'static str),
    /// Case-insensitive body substring regardless of status.
    Body(&'static str),
}

impl Matcher {
    fn matches(&self, status: Option<u16>, body_lower: &str) -> bool {
        match *self {
            Matcher::Status(code) => status == Some(code),
            Matcher::StatusRange(lo, hi) => status.is_some_and(|s| (lo..=hi).contains(&s)),
            Matcher::StatusBody(code, needle) => status == Some(code) && body_lower.contains(needle),
            Matcher::Body(needle) => body_lower.contains(needle),
        }
    }
}

/// One row of a platform's error table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRule {
    pub matcher: Matcher,
    pub code: ErrorCode,
}

impl ErrorRule {
    pub const fn new(matcher: Matcher, code: ErrorCode) -> Self {
        Self { matcher, code }
    }
}

/// Ordered classification table for one platform. First matching rule wins.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTable {
    pub platform: &'static str,
    pub rules: &'static [ErrorRule],
    pub fallback: ErrorCode,
}

impl ErrorTable {
    /// Classify a remote failure.
    ///
    /// `status` is `None` for payload-level failures (e.g. Slack's
    /// `{"ok": false}` responses delivered with HTTP 200). Body matchers
    /// are compared against the lower-cased body. Body patterns in tables
    /// must be lower case.
    pub fn classify(
        &self,
        status: Option<u16>,
        body: &str,
        retry_after: Option<Duration>,
    ) -> ConnectorError {
        let lower = body.to_lowercase();
        let code = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(status, &lower))
            .map(|rule| rule.code)
            .unwrap_or(self.fallback);

        let message = match status {
            Some(s) => format!("HTTP {}: {}", s, truncate(body, 300)),
            None => truncate(body, 300).to_string(),
        };

        let err = ConnectorError::new(self.platform, code, message);
        if code == ErrorCode::RateLimit {
            err.with_retry_after(retry_after)
        } else {
            err
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Parse a `Retry-After` header value given in (possibly fractional) seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TABLE: ErrorTable = ErrorTable {
        platform: "test",
        rules: &[
            ErrorRule::new(Matcher::StatusBody(403, "rate limit"), ErrorCode::RateLimit),
            ErrorRule::new(Matcher::Status(401), ErrorCode::AuthError),
            ErrorRule::new(Matcher::Status(403), ErrorCode::PermissionError),
            ErrorRule::new(Matcher::Status(404), ErrorCode::NotFound),
            ErrorRule::new(Matcher::Status(429), ErrorCode::RateLimit),
            ErrorRule::new(Matcher::Body("invalid_auth"), ErrorCode::AuthError),
            ErrorRule::new(Matcher::StatusRange(500, 599), ErrorCode::ApiError),
        ],
        fallback: ErrorCode::ApiError,
    };

    #[test]
    fn test_first_matching_rule_wins() {
        let err = TABLE.classify(Some(403), "API rate limit exceeded", None);
        assert_eq!(err.code, ErrorCode::RateLimit);
        assert!(err.retryable);

        let err = TABLE.classify(Some(403), "Resource not accessible", None);
        assert_eq!(err.code, ErrorCode::PermissionError);
        assert!(!err.retryable);
    }

    #[test]
    fn test_payload_level_classification() {
        let err = TABLE.classify(None, "invalid_auth", None);
        assert_eq!(err.code, ErrorCode::AuthError);
        assert_eq!(err.platform, "test");
    }

    #[test]
    fn test_retry_after_only_kept_for_rate_limits() {
        let wait = Some(Duration::from_secs(7));
        let err = TABLE.classify(Some(429), "slow down", wait);
        assert_eq!(err.retry_after, wait);

        let err = TABLE.classify(Some(503), "unavailable", wait);
        assert_eq!(err.code, ErrorCode::ApiError);
        assert!(err.retryable);
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn test_fallback_for_unknown_status() {
        let err = TABLE.classify(Some(418), "teapot", None);
        assert_eq!(err.code, ErrorCode::ApiError);
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        let err = ConnectorError::cancelled("github");
        assert!(err.is_cancelled());
        assert!(!err.retryable);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("3")), Some(Duration::from_secs(3)));
        assert_eq!(
            parse_retry_after(Some("1.5")),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_serialized_shape() {
        let err = TABLE.classify(Some(429), "slow down", Some(Duration::from_secs(2)));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["platform"], "test");
        assert_eq!(json["code"], "rate_limit");
        assert_eq!(json["retryable"], true);
        assert_eq!(json["retry_after"], 2.0);
    }
}
