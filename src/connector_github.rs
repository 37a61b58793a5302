//! GitHub connector (source control).
//!
//! Pulls pull requests, issues, and commits from one or more repositories
//! through the GitHub REST API.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.github.auth_config.metadata]
//! token = "ghp_..."                      # required
//! repositories = "acme/web,acme/api"     # required, owner/repo list
//!
//! [connectors.github.metadata]
//! fetch_pr_files = "true"                # list changed files per PR
//! # api_base_url = "https://github.example.com/api/v3"
//! ```
//!
//! # Extraction ceilings
//!
//! A single fetch returns at most 50 pull requests, 50 issues, and 100
//! commits across all repositories, each the oldest at or after `since`.
//! The caller's `limit` then keeps the oldest events of the three kinds
//! together. When any kind hits its ceiling, events newer than the last one
//! kept wait for the next cycle (see [`crate::window`]).
//!
//! Each pull request lists at most 3000 changed files, the most the API
//! returns.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AuthConfig, ConnectorConfig};
use crate::error::{ConnectorError, ErrorCode, ErrorRule, ErrorTable, Matcher};
use crate::http::PlatformClient;
use crate::models::{
    AuthResult, AuthType, EventType, NormalizedEvent, PlatformEvent, PlatformInfo,
    RateLimitEnvelope, PLATFORM_GITHUB,
};
use crate::normalize::{merge_unique, normalize_event};
use crate::traits::PlatformConnector;
use crate::window::FetchWindow;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const MAX_PULL_REQUESTS: usize = 50;
pub const MAX_ISSUES: usize = 50;
pub const MAX_COMMITS: usize = 100;
pub const MAX_PR_FILES: usize = 3000;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

const PAGE_SIZE: usize = 100;

static ERRORS: ErrorTable = ErrorTable {
    platform: PLATFORM_GITHUB,
    rules: &[
        ErrorRule::new(Matcher::StatusBody(403, "rate limit"), ErrorCode::RateLimit),
        ErrorRule::new(Matcher::Status(429), ErrorCode::RateLimit),
        ErrorRule::new(Matcher::Status(401), ErrorCode::AuthError),
        ErrorRule::new(Matcher::Status(403), ErrorCode::PermissionError),
        ErrorRule::new(Matcher::Status(404), ErrorCode::NotFound),
        ErrorRule::new(Matcher::Status(410), ErrorCode::NotFound),
        ErrorRule::new(Matcher::StatusRange(500, 599), ErrorCode::ApiError),
    ],
    fallback: ErrorCode::ApiError,
};

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
    #[serde(default)]
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    head: Option<GhBranch>,
    #[serde(default)]
    base: Option<GhBranch>,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    comments: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Present when the "issue" is really a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GhCommitPerson {
    #[serde(default)]
    name: Option<String>,
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    message: String,
    #[serde(default)]
    author: Option<GhCommitPerson>,
    committer: GhCommitPerson,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    commit: GhCommitDetail,
    #[serde(default)]
    author: Option<GhUser>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhFile {
    filename: String,
}

pub struct GitHubConnector {
    config: ConnectorConfig,
    client: PlatformClient,
    repositories: Vec<String>,
    fetch_pr_files: bool,
}

impl GitHubConnector {
    /// Validate the configuration and build the connector.
    ///
    /// Fails when the token or repository list is missing or malformed.
    pub fn new(config: ConnectorConfig) -> anyhow::Result<Self> {
        let token = config
            .auth_config
            .meta("token")
            .ok_or_else(|| anyhow!("github: auth_config.metadata.token is required"))?
            .to_string();

        let repositories = config.auth_config.meta_list("repositories");
        if repositories.is_empty() {
            bail!("github: auth_config.metadata.repositories must list at least one owner/repo");
        }
        for repo in &repositories {
            let mut parts = repo.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                bail!("github: repository '{}' must be in owner/repo form", repo);
            }
        }

        let base_url = config.meta("api_base_url").unwrap_or(DEFAULT_API_BASE).to_string();
        let fetch_pr_files = config.meta_parse("fetch_pr_files", true)?;
        let client = PlatformClient::new(
            PLATFORM_GITHUB,
            &base_url,
            format!("Bearer {}", token),
            &config.rate_limit,
            &ERRORS,
        )?;

        Ok(Self {
            config,
            client,
            repositories,
            fetch_pr_files,
        })
    }

    /// Every pull request updated at or after `since`. The list endpoint has
    /// no `since` filter and sorts newest first, so it is read down to the
    /// boundary and the ceiling is applied afterwards, oldest first.
    async fn fetch_pull_requests(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let pulls: Vec<GhPull> = self
                .client
                .get_json(
                    &format!("repos/{}/pulls", repo),
                    &[
                        ("state", "all".to_string()),
                        ("sort", "updated".to_string()),
                        ("direction", "desc".to_string()),
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                    cancel,
                )
                .await?
                .decode(PLATFORM_GITHUB)?;
            let page_len = pulls.len();

            for pr in pulls {
                // Sorted newest first: everything after this is older.
                if pr.updated_at < since {
                    return Ok(out);
                }
                out.push(pull_request_event(repo, pr));
            }

            if page_len < PAGE_SIZE {
                return Ok(out);
            }
            page += 1;
        }
    }

    /// Changed files of one pull request, up to [`MAX_PR_FILES`].
    async fn pull_request_files(
        &self,
        event: &PlatformEvent,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ConnectorError> {
        let repo = event.meta_str("repository").unwrap_or_default();
        let number = event.metadata["number"].as_u64().unwrap_or_default();
        let mut out = Vec::new();
        let mut page = 1usize;
        while out.len() < MAX_PR_FILES {
            let files: Vec<GhFile> = self
                .client
                .get_json(
                    &format!("repos/{}/pulls/{}/files", repo, number),
                    &[
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                    cancel,
                )
                .await?
                .decode(PLATFORM_GITHUB)?;
            let page_len = files.len();
            out.extend(files.into_iter().map(|f| f.filename));
            if page_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        out.truncate(MAX_PR_FILES);
        Ok(out)
    }

    /// The oldest issues updated at or after `since`, at most `cap`.
    /// Returns whether the repository had no more.
    async fn fetch_issues(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PlatformEvent>, bool), ConnectorError> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let issues: Vec<GhIssue> = self
                .client
                .get_json(
                    &format!("repos/{}/issues", repo),
                    &[
                        ("state", "all".to_string()),
                        ("sort", "updated".to_string()),
                        ("direction", "asc".to_string()),
                        ("since", format_since(since)),
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                    cancel,
                )
                .await?
                .decode(PLATFORM_GITHUB)?;
            let page_len = issues.len();

            for issue in issues {
                if issue.pull_request.is_some() || issue.updated_at < since {
                    continue;
                }
                out.push(issue_event(repo, issue));
                if out.len() >= cap {
                    return Ok((out, false));
                }
            }

            if page_len < PAGE_SIZE {
                return Ok((out, true));
            }
            page += 1;
        }
    }

    /// Every commit since `since`. The endpoint only lists newest first.
    async fn fetch_commits(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlatformEvent>, ConnectorError> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let commits: Vec<GhCommit> = self
                .client
                .get_json(
                    &format!("repos/{}/commits", repo),
                    &[
                        ("since", format_since(since)),
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                    cancel,
                )
                .await?
                .decode(PLATFORM_GITHUB)?;
            let page_len = commits.len();

            out.extend(
                commits
                    .into_iter()
                    .filter(|c| c.commit.committer.date >= since)
                    .map(|c| commit_event(repo, c)),
            );

            if page_len < PAGE_SIZE {
                return Ok(out);
            }
            page += 1;
        }
    }
}

fn format_since(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn label_names(labels: Vec<GhLabel>) -> Vec<String> {
    labels.into_iter().map(|l| l.name).collect()
}

fn pull_request_event(repo: &str, pr: GhPull) -> PlatformEvent {
    let merged = pr.merged_at.is_some();
    let state = if merged { "merged".to_string() } else { pr.state };
    let branch = pr.head.map(|h| h.name);
    let features: Vec<String> = branch
        .iter()
        .filter(|b| b.starts_with("feature/"))
        .cloned()
        .collect();

    PlatformEvent {
        id: format!("{}/pull/{}", repo, pr.number),
        event_type: EventType::PullRequest,
        timestamp: pr.updated_at,
        anchor: None,
        author: pr.user.map(|u| u.login).unwrap_or_default(),
        content: pr.body.unwrap_or_default(),
        title: Some(pr.title),
        metadata: json!({
            "repository": repo,
            "number": pr.number,
            "state": state,
            "merged": merged,
            "labels": label_names(pr.labels),
            "url": pr.html_url,
            "branch": branch,
            "base": pr.base.map(|b| b.name),
            "created_at": pr.created_at,
            "features": features,
        }),
        references: Vec::new(),
        platform: PLATFORM_GITHUB.to_string(),
    }
}

fn issue_event(repo: &str, issue: GhIssue) -> PlatformEvent {
    PlatformEvent {
        id: format!("{}/issues/{}", repo, issue.number),
        event_type: EventType::Issue,
        timestamp: issue.updated_at,
        anchor: None,
        author: issue.user.map(|u| u.login).unwrap_or_default(),
        content: issue.body.unwrap_or_default(),
        title: Some(issue.title),
        metadata: json!({
            "repository": repo,
            "number": issue.number,
            "state": issue.state,
            "labels": label_names(issue.labels),
            "url": issue.html_url,
            "comments": issue.comments,
            "created_at": issue.created_at,
        }),
        references: Vec::new(),
        platform: PLATFORM_GITHUB.to_string(),
    }
}

fn commit_event(repo: &str, commit: GhCommit) -> PlatformEvent {
    let message = commit.commit.message;
    let title = message.lines().next().unwrap_or_default().to_string();
    let author = commit
        .author
        .map(|a| a.login)
        .or_else(|| commit.commit.author.as_ref().and_then(|a| a.name.clone()))
        .unwrap_or_default();

    PlatformEvent {
        id: format!("{}/commit/{}", repo, commit.sha),
        event_type: EventType::Commit,
        timestamp: commit.commit.committer.date,
        anchor: None,
        author,
        content: message,
        title: Some(title),
        metadata: json!({
            "repository": repo,
            "sha": commit.sha,
            "url": commit.html_url,
            "authored_at": commit.commit.author.map(|a| a.date),
        }),
        references: Vec::new(),
        platform: PLATFORM_GITHUB.to_string(),
    }
}

#[async_trait]
impl PlatformConnector for GitHubConnector {
    async fn authenticate(
        &self,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, ConnectorError> {
        let token = auth
            .meta("token")
            .ok_or_else(|| ConnectorError::auth(PLATFORM_GITHUB, "missing token"))?;

        let response = self
            .client
            .get_json_as(&format!("Bearer {}", token), "user", &[], cancel)
            .await?;
        let scopes = response
            .header("x-oauth-scopes")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let user: GhUser = response.decode(PLATFORM_GITHUB)?;

        Ok(AuthResult {
            access_token: token.to_string(),
            user_id: user.id.to_string(),
            user_name: Some(user.login),
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
        let mut pulls = FetchWindow::new(since);
        let mut issues = FetchWindow::new(since);
        let mut commits = FetchWindow::new(since);
        for repo in &self.repositories {
            let found = self.fetch_pull_requests(repo, since, cancel).await?;
            pulls.add(found, MAX_PULL_REQUESTS, true);

            let (found, complete) = self.fetch_issues(repo, since, MAX_ISSUES, cancel).await?;
            issues.add(found, MAX_ISSUES, complete);

            let found = self.fetch_commits(repo, since, cancel).await?;
            commits.add(found, MAX_COMMITS, true);
        }

        let mut window = FetchWindow::new(since);
        window.absorb(pulls, MAX_PULL_REQUESTS);
        window.absorb(issues, MAX_ISSUES);
        window.absorb(commits, MAX_COMMITS);
        let horizon = window.horizon();
        let mut events = window.finish(limit);

        // Files are only listed for pull requests that made it into the batch.
        if self.fetch_pr_files {
            for event in events
                .iter_mut()
                .filter(|e| e.event_type == EventType::PullRequest)
            {
                let files = self.pull_request_files(event, cancel).await?;
                event.metadata["files"] = json!(files);
            }
        }

        tracing::debug!(
            platform = PLATFORM_GITHUB,
            events = events.len(),
            horizon = ?horizon,
            "fetched"
        );
        Ok(events)
    }

    fn normalize_data(&self, events: &[PlatformEvent]) -> Vec<NormalizedEvent> {
        events
            .iter()
            .map(|event| {
                let mut normalized = normalize_event(event);
                // An issue is the anchor for its own `#N` feature reference,
                // so PRs saying "Fixes #N" land on the same feature node.
                if event.event_type == EventType::Issue {
                    if let Some(number) = event.metadata["number"].as_u64() {
                        let mut features = vec![format!("#{}", number)];
                        merge_unique(&mut features, normalized.feature_references);
                        normalized.feature_references = features;
                    }
                }
                normalized
            })
            .collect()
    }

    fn schedule_sync(&self, _last_sync: Option<DateTime<Utc>>) -> Duration {
        self.config
            .sync_config
            .interval()
            .unwrap_or(DEFAULT_SYNC_INTERVAL)
    }

    fn get_platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            name: PLATFORM_GITHUB.to_string(),
            display_name: "GitHub".to_string(),
            supported_events: vec![
                EventType::PullRequest,
                EventType::Issue,
                EventType::Commit,
                EventType::FileChange,
            ],
            rate_limit: RateLimitEnvelope {
                requests_per_hour: self.config.rate_limit.requests_per_hour,
                requests_per_minute: self.config.rate_limit.requests_per_minute,
                burst_limit: self.config.rate_limit.burst_limit,
            },
            auth_type: AuthType::OAuth2,
            required_scopes: vec!["repo".to_string(), "read:org".to_string()],
            default_sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}
