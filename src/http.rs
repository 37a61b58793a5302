//! Rate-limited JSON client shared by the HTTP-based connectors.
//!
//! [`PlatformClient`] is the only path connectors use to reach a remote
//! API. Every request:
//!
//! 1. waits on the connector's [`RateLimiter`] (honoring cancellation),
//! 2. races the request against the cancellation token,
//! 3. classifies non-2xx responses through the platform's [`ErrorTable`],
//! 4. escalates the limiter backoff on rate-limit responses and resets it
//!    on success.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::{parse_retry_after, ConnectorError, ErrorCode, ErrorTable};
use crate::rate_limit::RateLimiter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded JSON response plus its headers.
#[derive(Debug)]
pub struct ApiResponse {
    pub body: Value,
    pub headers: HeaderMap,
}

impl ApiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decode the body into a typed payload.
    pub fn decode<T: DeserializeOwned>(self, platform: &str) -> Result<T, ConnectorError> {
        serde_json::from_value(self.body).map_err(|e| {
            ConnectorError::api(platform, format!("unexpected response shape: {}", e))
        })
    }
}

pub struct PlatformClient {
    platform: &'static str,
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    limiter: RateLimiter,
    errors: &'static ErrorTable,
}

impl PlatformClient {
    /// `auth_header` is the full `Authorization` value (`"Bearer ..."`,
    /// `"Bot ..."`).
    pub fn new(
        platform: &'static str,
        base_url: &str,
        auth_header: String,
        rate_limit: &RateLimitConfig,
        errors: &'static ErrorTable,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            platform,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            limiter: RateLimiter::new(platform, rate_limit),
            errors,
        })
    }

    pub fn platform(&self) -> &'static str {
        self.platform
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Classify a failure reported inside an otherwise successful payload.
    pub fn payload_error(&self, message: &str, retry_after: Option<Duration>) -> ConnectorError {
        let err = self.errors.classify(None, message, retry_after);
        self.escalate(err)
    }

    /// `GET {base_url}/{path}?{query}` with the connector's credentials.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ConnectorError> {
        self.get_json_as(&self.auth_header, path, query, cancel).await
    }

    /// Like [`get_json`](Self::get_json) with an explicit `Authorization`
    /// value, used to validate credentials other than the configured ones.
    pub async fn get_json_as(
        &self,
        auth_header: &str,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ConnectorError> {
        self.limiter.wait(cancel).await?;

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let request = self
            .http
            .get(&url)
            .header(AUTHORIZATION, auth_header)
            .header(USER_AGENT, concat!("knowledge-sync/", env!("CARGO_PKG_VERSION")))
            .query(query);

        tracing::debug!(platform = self.platform, path, "request");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectorError::cancelled(self.platform)),
            r = request.send() => r.map_err(|e| ConnectorError::from_transport(self.platform, &e))?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectorError::cancelled(self.platform)),
            r = response.text() => r.map_err(|e| ConnectorError::from_transport(self.platform, &e))?,
        };

        if !status.is_success() {
            let hint = retry_after_hint(&headers, &text);
            let err = self.errors.classify(Some(status.as_u16()), &text, hint);
            tracing::warn!(
                platform = self.platform,
                path,
                status = status.as_u16(),
                code = %err.code,
                "request failed"
            );
            return Err(self.escalate(err));
        }

        self.limiter.reset_backoff();

        let body = serde_json::from_str(&text).map_err(|e| {
            ConnectorError::api(self.platform, format!("invalid JSON from {}: {}", path, e))
        })?;
        Ok(ApiResponse { body, headers })
    }

    /// Rate-limit errors bump the limiter backoff. When the remote did not
    /// say how long to wait, the backoff delay becomes the suggestion.
    fn escalate(&self, mut err: ConnectorError) -> ConnectorError {
        if err.code == ErrorCode::RateLimit {
            let backoff = self.limiter.get_backoff_delay();
            if err.retry_after.is_none() {
                err.retry_after = Some(backoff);
            }
        }
        err
    }
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("limiter", &self.limiter)
            .finish()
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Suggested wait from `Retry-After`, an exhausted `x-ratelimit-reset`
/// epoch, or a JSON `retry_after` field, in that order.
pub fn retry_after_hint(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(d) = parse_retry_after(header("retry-after")) {
        return Some(d);
    }

    if header("x-ratelimit-remaining").map(str::trim) == Some("0") {
        if let Some(reset) = header("x-ratelimit-reset").and_then(|v| v.trim().parse::<i64>().ok())
        {
            let wait = reset - Utc::now().timestamp();
            return Some(Duration::from_secs(wait.max(1) as u64));
        }
    }

    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()))
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("12"));
        let hint = retry_after_hint(&headers, r#"{"retry_after": 1.0}"#);
        assert_eq!(hint, Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_retry_after_from_exhausted_reset() {
        let mut headers = HeaderMap::new();
        let reset = (Utc::now().timestamp() + 30).to_string();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&reset).unwrap());
        let hint = retry_after_hint(&headers, "").unwrap();
        assert!(hint >= Duration::from_secs(28) && hint <= Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_from_json_body() {
        let hint = retry_after_hint(&HeaderMap::new(), r#"{"message":"slow","retry_after":0.5}"#);
        assert_eq!(hint, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_no_hint() {
        assert_eq!(retry_after_hint(&HeaderMap::new(), "oops"), None);
    }
}
