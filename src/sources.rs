//! The `sources` command: every registered platform and its status.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::models::PlatformInfo;
use crate::registry::ConnectorRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub platform: String,
    pub configured: bool,
    pub enabled: bool,
    /// A connector was constructed from the configuration.
    pub active: bool,
    pub error: Option<String>,
    pub info: Option<PlatformInfo>,
}

/// Probe each registered platform by constructing its connector. Nothing
/// is fetched.
pub fn get_sources(registry: &ConnectorRegistry) -> Vec<SourceStatus> {
    registry
        .platforms()
        .into_iter()
        .map(|platform| {
            let config = registry.get_config(&platform);
            let configured = config.is_some();
            let enabled = config.as_ref().is_some_and(|c| c.enabled);
            let (active, error, info) = if enabled {
                match registry.create_connector(&platform) {
                    Ok(c) => (true, None, Some(c.get_platform_info())),
                    Err(e) => (false, Some(e.to_string()), None),
                }
            } else {
                (false, None, None)
            };
            SourceStatus {
                platform,
                configured,
                enabled,
                active,
                error,
                info,
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let registry = ConnectorRegistry::from_config(config);
    let sources = get_sources(&registry);

    println!(
        "{:<12} {:<11} {:<8} {:<7} {:<14} RATE LIMIT",
        "PLATFORM", "CONFIGURED", "ENABLED", "ACTIVE", "AUTH"
    );
    for s in &sources {
        let (auth, rate) = match &s.info {
            Some(info) => (
                format!("{:?}", info.auth_type),
                format!(
                    "{}/h {}/min burst {}",
                    info.rate_limit.requests_per_hour,
                    info.rate_limit.requests_per_minute,
                    info.rate_limit.burst_limit
                ),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<12} {:<11} {:<8} {:<7} {:<14} {}",
            s.platform, s.configured, s.enabled, s.active, auth, rate
        );
        if let Some(err) = &s.error {
            println!("  error: {}", err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_sources_report_each_builtin() {
        let cfg = parse_config(
            r#"
[connectors.github]
platform = "github"
enabled = true

[connectors.github.auth_config.metadata]
token = "ghp_test_token_value"
repositories = "acme/web"

[connectors.github.rate_limit]
requests_per_hour = 5000
requests_per_minute = 80
burst_limit = 10
backoff_multiplier = 2.0
max_retries = 3

[connectors.github.sync_config]
batch_size = 100

[connectors.slack]
platform = "slack"
enabled = false
"#,
        )
        .unwrap();
        let registry = ConnectorRegistry::from_config(&cfg);
        let sources = get_sources(&registry);
        let by_name = |n: &str| sources.iter().find(|s| s.platform == n).unwrap().clone();

        let github = by_name("github");
        assert!(github.configured && github.enabled && github.active);
        assert_eq!(github.info.unwrap().name, "github");

        let slack = by_name("slack");
        assert!(slack.configured && !slack.enabled && !slack.active);

        let discord = by_name("discord");
        assert!(!discord.configured && !discord.active);
    }

    #[test]
    fn test_missing_credentials_surface_as_error() {
        let cfg = parse_config(
            r#"
[connectors.discord]
platform = "discord"

[connectors.discord.rate_limit]
requests_per_minute = 50
burst_limit = 5
backoff_multiplier = 2.0

[connectors.discord.sync_config]
batch_size = 100
"#,
        )
        .unwrap();
        let registry = ConnectorRegistry::from_config(&cfg);
        let discord = get_sources(&registry)
            .into_iter()
            .find(|s| s.platform == "discord")
            .unwrap();
        assert!(discord.enabled);
        assert!(!discord.active);
        assert!(discord.error.is_some());
    }
}
