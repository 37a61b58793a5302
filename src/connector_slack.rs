//! Slack connector (channel-based chat).
//!
//! Reads channel history through the Slack Web API and expands threaded
//! parents with `conversations.replies`, up to `thread_depth` replies per
//! thread.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.slack.auth_config.metadata]
//! token = "xoxb-..."          # bot token, required
//! channels = "C0123,C0456"    # channel ids, required
//!
//! [connectors.slack.metadata]
//! thread_depth = "50"
//! ```
//!
//! A fetch keeps the oldest top-level messages across all channels, then
//! expands the threads among them. Replies sort with their parent, so a
//! batch cut at `limit` never leaves the checkpoint past an unread parent.
//!
//! Platform ids are `<channel>:<ts>`. A thread parent carries its own id as
//! `thread_id`; each reply carries the parent's id as both `thread_id` and
//! `parent_id`.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AuthConfig, ConnectorConfig};
use crate::error::{ConnectorError, ErrorCode, ErrorRule, ErrorTable, Matcher};
use crate::http::{retry_after_hint, ApiResponse, PlatformClient};
use crate::models::{
    AuthResult, AuthType, EventType, NormalizedEvent, PlatformEvent, PlatformInfo,
    RateLimitEnvelope, PLATFORM_SLACK,
};
use crate::normalize::normalize_all;
use crate::traits::PlatformConnector;
use crate::window::{trim_to_limit, FetchWindow};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2 * 60);

const HISTORY_PAGE: usize = 200;

/// Slack reports most failures as HTTP 200 with `{"ok": false, "error": ...}`.
static ERRORS: ErrorTable = ErrorTable {
    platform: PLATFORM_SLACK,
    rules: &[
        ErrorRule::new(Matcher::Status(429), ErrorCode::RateLimit),
        ErrorRule::new(Matcher::Body("ratelimited"), ErrorCode::RateLimit),
        ErrorRule::new(Matcher::Body("invalid_auth"), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Body("not_authed"), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Body("token_revoked"), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Body("account_inactive"), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Body("missing_scope"), ErrorCode::PermissionError),
        ErrorRule::new(Matcher::Body("not_in_channel"), ErrorCode::PermissionError),
        ErrorRule::new(Matcher::Body("channel_not_found"), ErrorCode::NotFound),
        ErrorRule::new(Matcher::Body("thread_not_found"), ErrorCode::NotFound),
        ErrorRule::new(Matcher::Status(401), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Status(403), ErrorCode::PermissionError),
        ErrorRule::new(Matcher::Status(404), ErrorCode::NotFound),
        ErrorRule::new(Matcher::StatusRange(500, 599), ErrorCode::ApiError),
    ],
    fallback: ErrorCode::ApiError,
};

/// Message subtypes that carry no conversational content.
const IGNORED_SUBTYPES: &[&str] = &["channel_join", "channel_leave", "channel_topic", "channel_purpose"];

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackReaction {
    name: String,
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    files: Vec<SlackFile>,
    #[serde(default)]
    reactions: Vec<SlackReaction>,
}

impl SlackMessage {
    fn is_thread_parent(&self) -> bool {
        self.reply_count > 0 && self.thread_ts.as_deref() == Some(self.ts.as_str())
    }

    /// `thread_ts` of a reply, `None` for top-level messages and parents.
    fn reply_to(&self) -> Option<&str> {
        self.thread_ts.as_deref().filter(|t| *t != self.ts)
    }

    fn author(&self) -> String {
        self.user
            .clone()
            .or_else(|| self.username.clone())
            .or_else(|| self.bot_id.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

impl MessagePage {
    fn next_cursor(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.response_metadata
            .as_ref()
            .and_then(|m| m.next_cursor.clone())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    user_id: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    team: Option<String>,
}

pub struct SlackConnector {
    config: ConnectorConfig,
    client: PlatformClient,
    channels: Vec<String>,
    thread_depth: usize,
}

impl SlackConnector {
    pub fn new(config: ConnectorConfig) -> anyhow::Result<Self> {
        let token = config
            .auth_config
            .meta("token")
            .ok_or_else(|| anyhow!("slack: auth_config.metadata.token is required"))?
            .to_string();
        let channels = config.auth_config.meta_list("channels");
        if channels.is_empty() {
            bail!("slack: auth_config.metadata.channels must list at least one channel id");
        }
        let thread_depth = config.thread_depth()?;
        let base_url = config.meta("api_base_url").unwrap_or(DEFAULT_API_BASE).to_string();
        let client = PlatformClient::new(
            PLATFORM_SLACK,
            &base_url,
            format!("Bearer {}", token),
            &config.rate_limit,
            &ERRORS,
        )?;
        Ok(Self {
            config,
            client,
            channels,
            thread_depth,
        })
    }

    /// Reject `{"ok": false}` payloads.
    fn check_ok(&self, response: &ApiResponse) -> Result<(), ConnectorError> {
        if response.body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let reason = response
            .body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let hint = retry_after_hint(&response.headers, "");
        tracing::warn!(platform = PLATFORM_SLACK, error = reason, "slack api error");
        Err(self.client.payload_error(reason, hint))
    }

    async fn call(
        &self,
        method: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<MessagePage, ConnectorError> {
        let response = self.client.get_json(method, query, cancel).await?;
        self.check_ok(&response)?;
        response.decode(PLATFORM_SLACK)
    }

    /// Top-level messages of one channel at or after `since`.
    ///
    /// History pages run newest first, so the whole range is read and the
    /// caller keeps the oldest.
    async fn fetch_channel(
        &self,
        channel: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("oldest", format_ts(since)),
                ("inclusive", "true".to_string()),
                ("limit", HISTORY_PAGE.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let page = self.call("conversations.history", &query, cancel).await?;
            cursor = page.next_cursor();

            out.extend(
                page.messages
                    .iter()
                    .filter(|m| !is_ignored(m))
                    .filter_map(|m| message_event(channel, m))
                    .filter(|e| e.timestamp >= since),
            );

            if cursor.is_none() {
                return Ok(out);
            }
        }
    }

    /// Replies to one thread, oldest first, bounded by `thread_depth`.
    /// Each reply is anchored at its parent's timestamp.
    async fn fetch_replies(
        &self,
        parent: &PlatformEvent,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        if self.thread_depth == 0 {
            return Ok(Vec::new());
        }
        let channel = parent.meta_str("channel").unwrap_or_default();
        let thread_ts = parent.meta_str("ts").unwrap_or_default();
        // The parent is returned first and counts against `limit`.
        let page = self
            .call(
                "conversations.replies",
                &[
                    ("channel", channel.to_string()),
                    ("ts", thread_ts.to_string()),
                    ("limit", (self.thread_depth + 1).to_string()),
                ],
                cancel,
            )
            .await?;

        let mut replies: Vec<PlatformEvent> = page
            .messages
            .iter()
            .filter(|m| m.ts != thread_ts && !is_ignored(m))
            .filter_map(|m| message_event(channel, m))
            .collect();
        replies.sort_by_key(|e| e.timestamp);
        replies.truncate(self.thread_depth);
        for reply in &mut replies {
            reply.anchor = Some(parent.timestamp);
        }
        Ok(replies)
    }
}

fn is_ignored(message: &SlackMessage) -> bool {
    message
        .subtype
        .as_deref()
        .is_some_and(|s| IGNORED_SUBTYPES.contains(&s))
}

/// Parse a Slack `ts` (`"1700000000.000100"`) into a UTC timestamp.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

fn message_id(channel: &str, ts: &str) -> String {
    format!("{}:{}", channel, ts)
}

fn message_event(channel: &str, message: &SlackMessage) -> Option<PlatformEvent> {
    let timestamp = parse_ts(&message.ts)?;
    let id = message_id(channel, &message.ts);

    let (event_type, thread_id, parent_id) = match message.reply_to() {
        Some(parent_ts) => {
            let parent = message_id(channel, parent_ts);
            (EventType::Message, Some(parent.clone()), Some(parent))
        }
        None if message.is_thread_parent() => (EventType::Thread, Some(id.clone()), None),
        None => (EventType::Message, None, None),
    };

    let files: Vec<String> = message.files.iter().filter_map(|f| f.name.clone()).collect();
    let reactions: Vec<Value> = message
        .reactions
        .iter()
        .map(|r| json!({ "name": r.name, "count": r.count }))
        .collect();

    Some(PlatformEvent {
        id,
        event_type,
        timestamp,
        anchor: None,
        author: message.author(),
        content: message.text.clone(),
        title: None,
        metadata: json!({
            "channel": channel,
            "ts": message.ts,
            "thread_id": thread_id,
            "parent_id": parent_id,
            "reply_count": message.reply_count,
            "reactions": reactions,
        }),
        references: files,
        platform: PLATFORM_SLACK.to_string(),
    })
}

#[async_trait]
impl PlatformConnector for SlackConnector {
    async fn authenticate(
        &self,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, ConnectorError> {
        let token = auth
            .meta("token")
            .ok_or_else(|| ConnectorError::auth(PLATFORM_SLACK, "missing bot token"))?;

        let response = self
            .client
            .get_json_as(&format!("Bearer {}", token), "auth.test", &[], cancel)
            .await?;
        self.check_ok(&response)?;
        let scopes = response
            .header("x-oauth-scopes")
            .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
            .unwrap_or_default();
        let identity: AuthTest = response.decode(PLATFORM_SLACK)?;
        tracing::debug!(platform = PLATFORM_SLACK, team = ?identity.team, "authenticated");

        Ok(AuthResult {
            access_token: token.to_string(),
            user_id: identity.user_id,
            user_name: identity.user,
            expires_at: None,
            scopes,
        })
    }

    async fn fetch_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let mut window = FetchWindow::new(since);
        for channel in &self.channels {
            let fetched = self.fetch_channel(channel, since, cancel).await?;
            tracing::debug!(
                platform = PLATFORM_SLACK,
                channel = %channel,
                events = fetched.len(),
                "channel fetched"
            );
            window.add(fetched, limit, true);
        }
        let parents = window.finish(limit);

        let mut events = Vec::with_capacity(parents.len());
        for parent in parents {
            let replies = if parent.event_type == EventType::Thread {
                self.fetch_replies(&parent, cancel).await?
            } else {
                Vec::new()
            };
            events.push(parent);
            events.extend(replies);
        }
        trim_to_limit(&mut events, limit);
        Ok(events)
    }

    fn normalize_data(&self, events: &[PlatformEvent]) -> Vec<NormalizedEvent> {
        normalize_all(events)
    }

    fn schedule_sync(&self, _last_sync: Option<DateTime<Utc>>) -> Duration {
        self.config
            .sync_config
            .interval()
            .unwrap_or(DEFAULT_SYNC_INTERVAL)
    }

    fn get_platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            name: PLATFORM_SLACK.to_string(),
            display_name: "Slack".to_string(),
            supported_events: vec![EventType::Message, EventType::Thread, EventType::Reaction],
            rate_limit: RateLimitEnvelope {
                requests_per_hour: self.config.rate_limit.requests_per_hour,
                requests_per_minute: self.config.rate_limit.requests_per_minute,
                burst_limit: self.config.rate_limit.burst_limit,
            },
            auth_type: AuthType::BotToken,
            required_scopes: vec![
                "channels:history".to_string(),
                "channels:read".to_string(),
                "users:read".to_string(),
            ],
            default_sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}
