//! Discord connector (guild-based chat).
//!
//! Reads text channels either listed per guild or configured directly,
//! follows threads started from messages, and keeps inline-reply linkage
//! from `message_reference`.
//!
//! Channels are read oldest first from the snowflake matching `since`.
//! A fetch keeps the oldest messages across channels, then expands the
//! threads among them; thread messages sort with their starter message.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.discord.auth_config.metadata]
//! token = "..."                 # bot token, required
//! guilds = "1122334455"         # guild ids; every text channel is read
//! channels = "9988776655"       # and/or explicit channel ids
//!
//! [connectors.discord.metadata]
//! thread_depth = "50"
//! ```

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AuthConfig, ConnectorConfig};
use crate::error::{ConnectorError, ErrorCode, ErrorRule, ErrorTable, Matcher};
use crate::http::PlatformClient;
use crate::models::{
    AuthResult, AuthType, EventType, NormalizedEvent, PlatformEvent, PlatformInfo,
    RateLimitEnvelope, PLATFORM_DISCORD,
};
use crate::normalize::normalize_all;
use crate::traits::PlatformConnector;
use crate::window::{trim_to_limit, FetchWindow};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Milliseconds since the Unix epoch at the start of 2015, Discord's epoch.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
const PAGE_SIZE: usize = 100;
const GUILD_TEXT: u8 = 0;
const THREAD_STARTER_MESSAGE: u8 = 21;

static ERRORS: ErrorTable = ErrorTable {
    platform: PLATFORM_DISCORD,
    rules: &[
        ErrorRule::new(Matcher::Status(429), ErrorCode::RateLimit),
        ErrorRule::new(Matcher::Status(401), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Status(403), ErrorCode::PermissionError),
        ErrorRule::new(Matcher::Status(404), ErrorCode::NotFound),
        ErrorRule::new(Matcher::StatusRange(500, 599), ErrorCode::ApiError),
    ],
    fallback: ErrorCode::ApiError,
};

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct MessageReference {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadRef {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(rename = "type", default)]
    kind: u8,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    message_reference: Option<MessageReference>,
    /// Thread started from this message.
    #[serde(default)]
    thread: Option<ThreadRef>,
}

pub struct DiscordConnector {
    config: ConnectorConfig,
    client: PlatformClient,
    guilds: Vec<String>,
    channels: Vec<String>,
    thread_depth: usize,
}

impl DiscordConnector {
    pub fn new(config: ConnectorConfig) -> anyhow::Result<Self> {
        let token = config
            .auth_config
            .meta("token")
            .ok_or_else(|| anyhow!("discord: auth_config.metadata.token is required"))?
            .to_string();
        let guilds = config.auth_config.meta_list("guilds");
        let channels = config.auth_config.meta_list("channels");
        if guilds.is_empty() && channels.is_empty() {
            bail!("discord: configure auth_config.metadata.guilds or channels");
        }
        let thread_depth = config.thread_depth()?;
        let base_url = config.meta("api_base_url").unwrap_or(DEFAULT_API_BASE).to_string();
        let client = PlatformClient::new(
            PLATFORM_DISCORD,
            &base_url,
            format!("Bot {}", token),
            &config.rate_limit,
            &ERRORS,
        )?;
        Ok(Self {
            config,
            client,
            guilds,
            channels,
            thread_depth,
        })
    }

    /// Explicit channels plus every text channel of each configured guild.
    async fn resolve_channels(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ConnectorError> {
        let mut channels = self.channels.clone();
        for guild in &self.guilds {
            let listed: Vec<DiscordChannel> = self
                .client
                .get_json(&format!("guilds/{}/channels", guild), &[], cancel)
                .await?
                .decode(PLATFORM_DISCORD)?;
            for channel in listed.into_iter().filter(|c| c.kind == GUILD_TEXT) {
                if !channels.contains(&channel.id) {
                    channels.push(channel.id);
                }
            }
        }
        Ok(channels)
    }

    /// The oldest messages of one channel at or after `since`, at most
    /// `cap`. Returns whether the channel had no more.
    async fn fetch_channel(
        &self,
        channel: &str,
        since: DateTime<Utc>,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PlatformEvent>, bool), ConnectorError> {
        let mut out = Vec::new();
        let mut after = snowflake_at(since);

        loop {
            let page = self.messages_after(channel, after, cancel).await?;
            let page_len = page.len();

            for message in &page {
                if let Ok(id) = message.id.parse::<u64>() {
                    after = after.max(id);
                }
                if message.timestamp < since {
                    continue;
                }
                if out.len() >= cap {
                    return Ok((out, false));
                }
                out.push(message_event(channel, message, None));
            }

            if page_len < PAGE_SIZE {
                return Ok((out, true));
            }
        }
    }

    /// The first `thread_depth` messages of the thread started from
    /// `parent`, each anchored at the parent's timestamp.
    async fn fetch_thread(
        &self,
        parent: &PlatformEvent,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let Some(thread) = parent.meta_str("thread_channel") else {
            return Ok(Vec::new());
        };
        let starter_id = parent.meta_str("message_id").unwrap_or_default();
        let mut out = Vec::new();
        let mut after = 0u64;

        while out.len() < self.thread_depth {
            let page = self.messages_after(thread, after, cancel).await?;
            let page_len = page.len();

            for message in &page {
                if let Ok(id) = message.id.parse::<u64>() {
                    after = after.max(id);
                }
                if message.kind == THREAD_STARTER_MESSAGE || message.id == starter_id {
                    continue;
                }
                let mut event = message_event(thread, message, Some(&parent.id));
                event.anchor = Some(parent.timestamp);
                out.push(event);
            }

            if page_len < PAGE_SIZE {
                break;
            }
        }
        out.truncate(self.thread_depth);
        Ok(out)
    }

    /// One page of messages created after the snowflake `after`, oldest
    /// first.
    async fn messages_after(
        &self,
        channel: &str,
        after: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscordMessage>, ConnectorError> {
        let mut page: Vec<DiscordMessage> = self
            .client
            .get_json(
                &format!("channels/{}/messages", channel),
                &[("after", after.to_string()), ("limit", PAGE_SIZE.to_string())],
                cancel,
            )
            .await?
            .decode(PLATFORM_DISCORD)?;
        // Pages arrive newest first.
        page.sort_by_key(|m| m.id.parse::<u64>().unwrap_or_default());
        Ok(page)
    }
}

/// Smallest snowflake for a moment in time. Messages with a larger id were
/// created at or after `at`.
pub fn snowflake_at(at: DateTime<Utc>) -> u64 {
    let offset = at.timestamp_millis() - DISCORD_EPOCH_MS;
    if offset <= 0 {
        0
    } else {
        (offset as u64) << 22
    }
}

fn message_id(channel: &str, id: &str) -> String {
    format!("{}:{}", channel, id)
}

/// `thread_parent` is set for messages read from a thread channel.
fn message_event(
    channel: &str,
    message: &DiscordMessage,
    thread_parent: Option<&str>,
) -> PlatformEvent {
    let id = message_id(channel, &message.id);

    let inline_parent = message.message_reference.as_ref().and_then(|r| {
        let target = r.message_id.as_deref()?;
        Some(message_id(r.channel_id.as_deref().unwrap_or(channel), target))
    });

    let (event_type, thread_id, parent_id) = match (thread_parent, &message.thread) {
        (Some(parent), _) => (
            EventType::Message,
            Some(parent.to_string()),
            Some(inline_parent.unwrap_or_else(|| parent.to_string())),
        ),
        (None, Some(_)) => (EventType::Thread, Some(id.clone()), None),
        (None, None) => (EventType::Message, inline_parent.clone(), inline_parent),
    };

    PlatformEvent {
        id,
        event_type,
        timestamp: message.timestamp,
        anchor: None,
        author: message.author.username.clone(),
        content: message.content.clone(),
        title: message.thread.as_ref().and_then(|t| t.name.clone()),
        metadata: json!({
            "channel": channel,
            "message_id": message.id,
            "author_id": message.author.id,
            "thread_id": thread_id,
            "parent_id": parent_id,
            "thread_channel": message.thread.as_ref().map(|t| t.id.clone()),
        }),
        references: message.attachments.iter().map(|a| a.filename.clone()).collect(),
        platform: PLATFORM_DISCORD.to_string(),
    }
}

#[async_trait]
impl PlatformConnector for DiscordConnector {
    async fn authenticate(
        &self,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, ConnectorError> {
        let token = auth
            .meta("token")
            .ok_or_else(|| ConnectorError::auth(PLATFORM_DISCORD, "missing bot token"))?;
        let me: DiscordUser = self
            .client
            .get_json_as(&format!("Bot {}", token), "users/@me", &[], cancel)
            .await?
            .decode(PLATFORM_DISCORD)?;
        Ok(AuthResult {
            access_token: token.to_string(),
            user_id: me.id,
            user_name: Some(me.username),
            expires_at: None,
            scopes: vec!["bot".to_string()],
        })
    }

    async fn fetch_events(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let channels = self.resolve_channels(cancel).await?;
        let mut window = FetchWindow::new(since);
        for channel in &channels {
            let (found, complete) = self.fetch_channel(channel, since, limit, cancel).await?;
            window.add(found, limit, complete);
        }
        let parents = window.finish(limit);

        let mut events = Vec::with_capacity(parents.len());
        for parent in parents {
            let replies = if parent.event_type == EventType::Thread {
                self.fetch_thread(&parent, cancel).await?
            } else {
                Vec::new()
            };
            events.push(parent);
            events.extend(replies);
        }
        trim_to_limit(&mut events, limit);
        tracing::debug!(
            platform = PLATFORM_DISCORD,
            channels = channels.len(),
            events = events.len(),
            "fetched"
        );
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
            name: PLATFORM_DISCORD.to_string(),
            display_name: "Discord".to_string(),
            supported_events: vec![EventType::Message, EventType::Thread, EventType::Discussion],
            rate_limit: RateLimitEnvelope {
                requests_per_hour: self.config.rate_limit.requests_per_hour,
                requests_per_minute: self.config.rate_limit.requests_per_minute,
                burst_limit: self.config.rate_limit.burst_limit,
            },
            auth_type: AuthType::BotToken,
            required_scopes: vec!["bot".to_string(), "messages.read".to_string()],
            default_sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}
