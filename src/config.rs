//! Configuration loading and validation.
//!
//! Configuration comes from a TOML file. When the file does not exist,
//! [`load_config`] falls back to per-platform environment variables so a
//! single-tenant deployment can run with nothing but tokens exported.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/ksync.sqlite"
//!
//! [[tenants]]
//! id = "acme"
//! project = "acme/web"
//! platforms = ["github", "slack"]
//!
//! [connectors.github]
//! platform = "github"
//! enabled = true
//!
//! [connectors.github.auth_config.metadata]
//! token = "ghp_..."
//! repositories = "acme/web,acme/api"
//!
//! [connectors.github.rate_limit]
//! requests_per_hour = 5000
//! requests_per_minute = 80
//! burst_limit = 10
//! backoff_multiplier = 2.0
//! max_retries = 3
//!
//! [connectors.github.sync_config]
//! batch_size = 100
//! sync_interval = 300
//! max_lookback = 2592000
//! incremental_sync = true
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{PLATFORM_DISCORD, PLATFORM_GITHUB, PLATFORM_SLACK};

/// Replies fetched per thread when `metadata.thread_depth` is unset.
pub const DEFAULT_THREAD_DEPTH: usize = 50;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub context_processor: ContextProcessorConfig,
    #[serde(default = "default_tenants")]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/ksync.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on sync cycles running at the same time.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    /// How long `run` waits for workers after a shutdown signal.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: default_max_concurrent_syncs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_max_concurrent_syncs() -> usize {
    4
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextProcessorConfig {
    /// `"heuristic"` (built in) or `"http"`.
    #[serde(default = "default_processor")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_processor_timeout")]
    pub timeout_secs: u64,
}

impl Default for ContextProcessorConfig {
    fn default() -> Self {
        Self {
            provider: default_processor(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: default_processor_timeout(),
        }
    }
}

fn default_processor() -> String {
    "heuristic".to_string()
}
fn default_processor_timeout() -> u64 {
    60
}

/// A tenant and the project scope its events are written into.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub id: String,
    pub project: String,
    /// Platforms synced for this tenant. Empty means every enabled platform.
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl TenantConfig {
    pub fn syncs(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }
}

fn default_tenants() -> Vec<TenantConfig> {
    vec![TenantConfig {
        id: "default".to_string(),
        project: "default".to_string(),
        platforms: Vec::new(),
    }]
}

/// Per-platform connector configuration.
///
/// Handed by value to a connector at construction time and never mutated
/// afterwards; only the registry replaces it via `set_config`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConnectorConfig {
    /// Defaults to the `[connectors.<name>]` table key.
    #[serde(default)]
    pub platform: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_config: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sync_config: SyncConfig,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Platform credentials and targets (`token`, `repositories`, `channels`, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Comma-separated metadata list, trimmed, empties removed.
    pub fn meta_list(&self, key: &str) -> Vec<String> {
        self.meta(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metadata: BTreeMap<&str, &str> = self
            .metadata
            .iter()
            .map(|(k, v)| {
                if is_secret_key(k) {
                    (k.as_str(), "***")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .field("metadata", &metadata)
            .finish()
    }
}

fn is_secret_key(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.contains("token") || k.contains("secret") || k.contains("password")
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_hour: u32,
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst_limit: u32,
    #[serde(default)]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub batch_size: usize,
    /// Seconds between cycles. Zero means the platform default.
    #[serde(default)]
    pub sync_interval: u64,
    /// Seconds. Zero means unbounded.
    #[serde(default)]
    pub max_lookback: u64,
    #[serde(default = "default_true")]
    pub incremental_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 0,
            sync_interval: 0,
            max_lookback: 0,
            incremental_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.sync_interval > 0).then(|| Duration::from_secs(self.sync_interval))
    }

    pub fn lookback(&self) -> Option<Duration> {
        (self.max_lookback > 0).then(|| Duration::from_secs(self.max_lookback))
    }
}

/// Built-in defaults for a known platform.
///
/// Returns `None` for platforms this crate has no connector for.
pub fn platform_defaults(platform: &str) -> Option<(RateLimitConfig, SyncConfig)> {
    let (rph, rpm, burst, batch, interval) = match platform {
        PLATFORM_GITHUB => (5000, 80, 10, 100, 300),
        PLATFORM_SLACK => (3000, 50, 5, 200, 120),
        PLATFORM_DISCORD => (3000, 50, 5, 100, 120),
        _ => return None,
    };
    Some((
        RateLimitConfig {
            requests_per_hour: rph,
            requests_per_minute: rpm,
            burst_limit: burst,
            backoff_multiplier: 2.0,
            max_retries: 3,
        },
        SyncConfig {
            batch_size: batch,
            sync_interval: interval,
            max_lookback: 0,
            incremental_sync: true,
        },
    ))
}

impl ConnectorConfig {
    /// A config for `platform` populated with that platform's defaults.
    pub fn with_defaults(platform: &str) -> Self {
        let mut cfg = Self {
            platform: platform.to_string(),
            enabled: true,
            auth_config: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sync_config: SyncConfig::default(),
            metadata: BTreeMap::new(),
        };
        cfg.apply_defaults();
        cfg
    }

    /// Fill zero-valued rate-limit and sync fields from platform defaults.
    pub fn apply_defaults(&mut self) {
        let Some((rl, sync)) = platform_defaults(&self.platform) else {
            return;
        };
        if self.rate_limit.requests_per_hour == 0 {
            self.rate_limit.requests_per_hour = rl.requests_per_hour;
        }
        if self.rate_limit.requests_per_minute == 0 {
            self.rate_limit.requests_per_minute = rl.requests_per_minute;
        }
        if self.rate_limit.burst_limit == 0 {
            self.rate_limit.burst_limit = rl.burst_limit;
        }
        if self.rate_limit.backoff_multiplier == 0.0 {
            self.rate_limit.backoff_multiplier = rl.backoff_multiplier;
        }
        if self.rate_limit.max_retries == 0 {
            self.rate_limit.max_retries = rl.max_retries;
        }
        if self.sync_config.batch_size == 0 {
            self.sync_config.batch_size = sync.batch_size;
        }
    }

    /// Reject values that would break the rate limiter or the sync loop.
    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            bail!("connector platform must not be empty");
        }
        let rl = &self.rate_limit;
        if rl.requests_per_minute == 0 {
            bail!("{}: rate_limit.requests_per_minute must be > 0", self.platform);
        }
        if rl.burst_limit == 0 {
            bail!("{}: rate_limit.burst_limit must be > 0", self.platform);
        }
        if !(rl.backoff_multiplier.is_finite() && rl.backoff_multiplier > 1.0) {
            bail!(
                "{}: rate_limit.backoff_multiplier must be > 1.0 (got {})",
                self.platform,
                rl.backoff_multiplier
            );
        }
        if self.sync_config.batch_size == 0 {
            bail!("{}: sync_config.batch_size must be > 0", self.platform);
        }
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Maximum replies traversed per thread by the chat connectors.
    pub fn thread_depth(&self) -> Result<usize> {
        self.meta_parse("thread_depth", DEFAULT_THREAD_DEPTH)
    }

    /// Parse a metadata value, falling back to `default` when absent.
    pub fn meta_parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.meta(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("{}: invalid metadata.{} '{}'", self.platform, key, raw)),
            None => Ok(default),
        }
    }
}

/// Load configuration from `path`, or from the environment if the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using environment");
        config_from_env(&|key| std::env::var(key).ok())
    };

    for (name, cfg) in config.connectors.iter_mut() {
        if cfg.platform.is_empty() {
            cfg.platform = name.clone();
        }
        cfg.apply_defaults();
    }

    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.orchestrator.max_concurrent_syncs == 0 {
        bail!("orchestrator.max_concurrent_syncs must be >= 1");
    }
    if config.tenants.is_empty() {
        bail!("at least one tenant must be configured");
    }
    for tenant in &config.tenants {
        if tenant.id.trim().is_empty() || tenant.project.trim().is_empty() {
            bail!("tenant id and project must not be empty");
        }
    }
    for (name, cfg) in &config.connectors {
        if name != &cfg.platform {
            bail!(
                "connectors.{} declares platform '{}'; the table key must match",
                name,
                cfg.platform
            );
        }
        if cfg.enabled {
            cfg.validate()?;
        }
    }
    match config.context_processor.provider.as_str() {
        "heuristic" => {}
        "http" => {
            if config.context_processor.endpoint.is_none() {
                bail!("context_processor.endpoint is required when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown context processor: '{}'. Must be heuristic or http.",
            other
        ),
    }
    Ok(())
}

/// Build a configuration from environment variables.
///
/// `lookup` abstracts `std::env::var` so tests stay hermetic.
pub fn config_from_env(lookup: &dyn Fn(&str) -> Option<String>) -> Config {
    let mut connectors = HashMap::new();

    let env_platforms: [(&str, &str, &[(&str, &str)]); 3] = [
        (
            PLATFORM_GITHUB,
            "GITHUB_TOKEN",
            &[("GITHUB_REPOSITORIES", "repositories")],
        ),
        (
            PLATFORM_SLACK,
            "SLACK_BOT_TOKEN",
            &[("SLACK_CHANNELS", "channels")],
        ),
        (
            PLATFORM_DISCORD,
            "DISCORD_BOT_TOKEN",
            &[("DISCORD_GUILDS", "guilds"), ("DISCORD_CHANNELS", "channels")],
        ),
    ];

    for (platform, token_var, extra) in env_platforms {
        let Some(token) = lookup(token_var).filter(|t| !t.trim().is_empty()) else {
            continue;
        };
        let prefix = platform.to_ascii_uppercase();
        let mut cfg = ConnectorConfig::with_defaults(platform);
        cfg.auth_config.client_id = lookup(&format!("{}_CLIENT_ID", prefix));
        cfg.auth_config.client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix));
        cfg.auth_config
            .metadata
            .insert("token".to_string(), token.trim().to_string());
        for (var, key) in extra {
            if let Some(value) = lookup(var) {
                cfg.auth_config.metadata.insert(key.to_string(), value);
            }
        }
        connectors.insert(platform.to_string(), cfg);
    }

    let db = lookup("KSYNC_DB_PATH")
        .map(|p| DbConfig {
            path: PathBuf::from(p),
        })
        .unwrap_or_default();

    Config {
        db,
        server: ServerConfig::default(),
        orchestrator: OrchestratorConfig::default(),
        context_processor: ContextProcessorConfig::default(),
        tenants: default_tenants(),
        connectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let cfg = parse_config(
            r#"
[db]
path = "/tmp/ks.sqlite"

[connectors.github]
platform = "github"

[connectors.github.auth_config.metadata]
token = "abc"
repositories = "acme/web"
"#,
        )
        .unwrap();
        assert_eq!(cfg.tenants.len(), 1);
        assert_eq!(cfg.tenants[0].id, "default");
        let gh = &cfg.connectors["github"];
        assert!(gh.enabled);
        assert_eq!(gh.auth_config.meta("token"), Some("abc"));
        assert_eq!(gh.auth_config.meta_list("repositories"), vec!["acme/web"]);
    }

    #[test]
    fn test_apply_defaults_fills_only_zero_fields() {
        let mut cfg = ConnectorConfig::with_defaults("slack");
        assert_eq!(cfg.rate_limit.requests_per_minute, 50);
        assert_eq!(cfg.sync_config.batch_size, 200);

        cfg.rate_limit.burst_limit = 2;
        cfg.rate_limit.requests_per_minute = 0;
        cfg.apply_defaults();
        assert_eq!(cfg.rate_limit.burst_limit, 2);
        assert_eq!(cfg.rate_limit.requests_per_minute, 50);
    }

    #[test]
    fn test_validate_rejects_bad_rate_limits() {
        let mut cfg = ConnectorConfig::with_defaults("github");
        assert!(cfg.validate().is_ok());

        cfg.rate_limit.backoff_multiplier = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ConnectorConfig::with_defaults("github");
        cfg.rate_limit.burst_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_fallback_enables_platforms_with_tokens() {
        let env: HashMap<&str, &str> = [
            ("GITHUB_TOKEN", "ghp_x"),
            ("GITHUB_REPOSITORIES", "acme/web,acme/api"),
            ("DISCORD_BOT_TOKEN", "bot"),
            ("DISCORD_GUILDS", "123"),
        ]
        .into_iter()
        .collect();
        let cfg = config_from_env(&|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.connectors.len(), 2);
        let gh = &cfg.connectors["github"];
        assert_eq!(
            gh.auth_config.meta_list("repositories"),
            vec!["acme/web", "acme/api"]
        );
        assert_eq!(gh.rate_limit.burst_limit, 10);
        assert_eq!(cfg.connectors["discord"].auth_config.meta("guilds"), Some("123"));
        assert!(!cfg.connectors.contains_key("slack"));
    }

    #[test]
    fn test_auth_config_debug_masks_secrets() {
        let mut auth = AuthConfig::default();
        auth.metadata.insert("token".into(), "super-secret".into());
        auth.metadata.insert("channels".into(), "C1".into());
        auth.client_secret = Some("shh".into());
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("shh"));
        assert!(rendered.contains("C1"));
    }

    #[test]
    fn test_tenant_platform_filter() {
        let tenant = TenantConfig {
            id: "t".into(),
            project: "p".into(),
            platforms: vec!["slack".into()],
        };
        assert!(tenant.syncs("slack"));
        assert!(!tenant.syncs("github"));
    }
}
