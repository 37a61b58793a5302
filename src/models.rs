//! Core data models that flow through the ingestion pipeline.
//!
//! [`PlatformEvent`]s are produced by connectors and immediately turned into
//! [`NormalizedEvent`]s, the platform-agnostic shape handed to the context
//! processor and from there into the knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const PLATFORM_GITHUB: &str = "github";
pub const PLATFORM_SLACK: &str = "slack";
pub const PLATFORM_DISCORD: &str = "discord";

/// Kind of activity captured by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PullRequest,
    Issue,
    Commit,
    Message,
    Thread,
    Reaction,
    FileChange,
    Discussion,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::PullRequest,
        EventType::Issue,
        EventType::Commit,
        EventType::Message,
        EventType::Thread,
        EventType::Reaction,
        EventType::FileChange,
        EventType::Discussion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PullRequest => "pull_request",
            EventType::Issue => "issue",
            EventType::Commit => "commit",
            EventType::Message => "message",
            EventType::Thread => "thread",
            EventType::Reaction => "reaction",
            EventType::FileChange => "file_change",
            EventType::Discussion => "discussion",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown event type: '{}'", s))
    }
}

/// Raw activity unit as fetched from a platform.
///
/// `metadata` carries platform-specific detail that normalization reads
/// (`thread_id`, `parent_id`, `labels`, `state`, `files`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Timestamp of the event this one was fetched through, such as a
    /// reply's thread parent. Unset for events read straight from a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<DateTime<Utc>>,
    pub author: String,
    pub content: String,
    pub title: Option<String>,
    pub metadata: serde_json::Value,
    pub references: Vec<String>,
    pub platform: String,
}

impl PlatformEvent {
    /// Where the event sits in its source stream. Checkpoints advance by
    /// position, never past an event that has not been read.
    pub fn position(&self) -> DateTime<Utc> {
        self.anchor.unwrap_or(self.timestamp)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn meta_strings(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Canonical event shape shared by every platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub platform_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub content: String,
    pub title: Option<String>,
    pub thread_id: Option<String>,
    pub parent_id: Option<String>,
    pub file_references: Vec<String>,
    pub feature_references: Vec<String>,
    pub labels: Vec<String>,
    pub state: Option<String>,
    pub platform: String,
}

/// Outcome of a successful `authenticate` call. Never persisted verbatim.
#[derive(Clone, Serialize)]
pub struct AuthResult {
    #[serde(skip_serializing)]
    pub access_token: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl AuthResult {
    /// The token with everything but the last four characters hidden.
    pub fn masked_token(&self) -> String {
        mask_secret(&self.access_token)
    }
}

impl fmt::Debug for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResult")
            .field("access_token", &self.masked_token())
            .field("user_id", &self.user_id)
            .field("user_name", &self.user_name)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

/// How a platform authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    OAuth2,
    BotToken,
    PersonalAccessToken,
}

/// Published rate-limit envelope of a platform.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitEnvelope {
    pub requests_per_hour: u32,
    pub requests_per_minute: u32,
    pub burst_limit: u32,
}

/// Static capability descriptor returned by `get_platform_info`.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub name: String,
    pub display_name: String,
    pub supported_events: Vec<EventType>,
    pub rate_limit: RateLimitEnvelope,
    pub auth_type: AuthType,
    pub required_scopes: Vec<String>,
    pub default_sync_interval: Duration,
}

/// Last successfully persisted point for one (tenant, connector) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCheckpoint {
    pub tenant: String,
    pub connector: String,
    pub last_sync: DateTime<Utc>,
}
