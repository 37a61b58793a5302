//! The platform connector contract.
//!
//! Every platform integration implements [`PlatformConnector`]: exactly
//! five operations covering authentication, incremental fetch, pure
//! normalization, scheduling, and a static capability descriptor.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │   name ──▶ factory + ConnectorConfig     │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │ github  │ │  slack  │ │  discord   │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   ConnectorManager ──▶ IngestionOrchestrator
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use chrono::{DateTime, Utc};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use knowledge_sync::config::AuthConfig;
//! use knowledge_sync::error::ConnectorError;
//! use knowledge_sync::models::*;
//! use knowledge_sync::traits::PlatformConnector;
//!
//! struct Quiet;
//!
//! #[async_trait]
//! impl PlatformConnector for Quiet {
//!     async fn authenticate(
//!         &self,
//!         _auth: &AuthConfig,
//!         _cancel: &CancellationToken,
//!     ) -> Result<AuthResult, ConnectorError> {
//!         Err(ConnectorError::auth("quiet", "no credentials"))
//!     }
//!
//!     async fn fetch_events(
//!         &self,
//!         _since: DateTime<Utc>,
//!         _limit: usize,
//!         _cancel: &CancellationToken,
//!     ) -> Result<Vec<PlatformEvent>, ConnectorError> {
//!         Ok(vec![])
//!     }
//!
//!     fn normalize_data(&self, events: &[PlatformEvent]) -> Vec<NormalizedEvent> {
//!         knowledge_sync::normalize::normalize_all(events)
//!     }
//!
//!     fn schedule_sync(&self, _last_sync: Option<DateTime<Utc>>) -> Duration {
//!         Duration::from_secs(60)
//!     }
//!
//!     fn get_platform_info(&self) -> PlatformInfo {
//!         PlatformInfo {
//!             name: "quiet".into(),
//!             display_name: "Quiet".into(),
//!             supported_events: vec![EventType::Message],
//!             rate_limit: RateLimitEnvelope {
//!                 requests_per_hour: 60,
//!                 requests_per_minute: 1,
//!                 burst_limit: 1,
//!             },
//!             auth_type: AuthType::BotToken,
//!             required_scopes: vec![],
//!             default_sync_interval: Duration::from_secs(60),
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::AuthConfig;
use crate::error::ConnectorError;
use crate::models::{AuthResult, NormalizedEvent, PlatformEvent, PlatformInfo};

/// A platform-specific adapter.
///
/// Implementations must be safe to call from several workers at once; the
/// orchestrator shares one instance across every tenant syncing the
/// platform. Remote calls go through the connector's own rate limiter and
/// honor `cancel` promptly.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Validate credentials with a cheap identity call.
    ///
    /// Fails with an `auth_error` (not retryable) when credentials are
    /// missing or rejected.
    async fn authenticate(
        &self,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, ConnectorError>;

    /// Fetch at most `limit` events whose timestamp is at or after `since`.
    async fn fetch_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError>;

    /// Pure mapping to the canonical shape. Preserves thread linkage and
    /// every file and label reference found in metadata.
    fn normalize_data(&self, events: &[PlatformEvent]) -> Vec<NormalizedEvent>;

    /// Delay before the next cycle: the configured interval, or the
    /// platform default when unset.
    fn schedule_sync(&self, last_sync: Option<DateTime<Utc>>) -> Duration;

    /// Static capability descriptor.
    fn get_platform_info(&self) -> PlatformInfo;
}
