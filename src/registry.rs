//! Connector registry and the live connector manager.
//!
//! The [`ConnectorRegistry`] maps a platform name to a factory and to that
//! platform's [`ConnectorConfig`]. The [`ConnectorManager`] holds the set of
//! connectors actually instantiated from the registry.
//!
//! ```text
//! register("github", factory) ─┐
//! set_config(github_cfg) ──────┼─▶ create_connector("github") ─▶ Arc<dyn PlatformConnector>
//!                              │
//! ConnectorManager::initialize ┘   (one failure never blocks another platform)
//! ```
//!
//! Platforms are administered independently: removing or disabling one
//! platform's configuration never changes whether another can be created
//! or keeps running.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConnectorConfig};
use crate::connector_discord::DiscordConnector;
use crate::connector_github::GitHubConnector;
use crate::connector_slack::SlackConnector;
use crate::models::{PLATFORM_DISCORD, PLATFORM_GITHUB, PLATFORM_SLACK};
use crate::traits::PlatformConnector;

/// Builds a connector from its configuration.
pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorConfig) -> anyhow::Result<Arc<dyn PlatformConnector>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("platform '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("platform '{0}' is not registered")]
    NotRegistered(String),
    #[error("platform '{0}' has no configuration")]
    NotConfigured(String),
    #[error("platform '{0}' is disabled")]
    Disabled(String),
    #[error("invalid configuration for '{platform}': {source}")]
    InvalidConfig {
        platform: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create connector '{platform}': {source}")]
    Factory {
        platform: String,
        #[source]
        source: anyhow::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Factories and configurations keyed by platform name.
///
/// Interior locking makes every operation safe to call from concurrent
/// workers through a shared reference.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<BTreeMap<String, ConnectorFactory>>,
    configs: RwLock<HashMap<String, ConnectorConfig>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the GitHub, Slack, and Discord factories registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [(&str, ConnectorFactory); 3] = [
            (PLATFORM_GITHUB, Arc::new(github)),
            (PLATFORM_SLACK, Arc::new(slack)),
            (PLATFORM_DISCORD, Arc::new(discord)),
        ];
        for (platform, factory) in builtins {
            // A fresh registry cannot hold duplicates.
            let _ = registry.register(platform, factory);
        }
        registry
    }

    /// Built-in factories plus every connector section of `config`.
    ///
    /// A section that fails validation is logged and left unconfigured so
    /// the remaining platforms still load.
    pub fn from_config(config: &Config) -> Self {
        let registry = Self::with_builtins();
        for cfg in config.connectors.values() {
            if let Err(e) = registry.set_config(cfg.clone()) {
                tracing::warn!(platform = %cfg.platform, error = %e, "connector config rejected");
            }
        }
        registry
    }

    /// Register a factory. Fails if the platform already has one.
    pub fn register(
        &self,
        platform: &str,
        factory: ConnectorFactory,
    ) -> Result<(), RegistryError> {
        let mut factories = write(&self.factories);
        if factories.contains_key(platform) {
            return Err(RegistryError::AlreadyRegistered(platform.to_string()));
        }
        factories.insert(platform.to_string(), factory);
        Ok(())
    }

    /// Validate and store a platform configuration, replacing any previous one.
    pub fn set_config(&self, config: ConnectorConfig) -> Result<(), RegistryError> {
        if config.enabled {
            config
                .validate()
                .map_err(|source| RegistryError::InvalidConfig {
                    platform: config.platform.clone(),
                    source,
                })?;
        }
        write(&self.configs).insert(config.platform.clone(), config);
        Ok(())
    }

    pub fn get_config(&self, platform: &str) -> Option<ConnectorConfig> {
        read(&self.configs).get(platform).cloned()
    }

    pub fn remove_config(&self, platform: &str) -> Option<ConnectorConfig> {
        write(&self.configs).remove(platform)
    }

    pub fn is_registered(&self, platform: &str) -> bool {
        read(&self.factories).contains_key(platform)
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<String> {
        read(&self.factories).keys().cloned().collect()
    }

    /// Instantiate a connector for `platform`.
    ///
    /// Fails when no factory is registered, no configuration is set, or
    /// the configuration is disabled.
    pub fn create_connector(
        &self,
        platform: &str,
    ) -> Result<Arc<dyn PlatformConnector>, RegistryError> {
        let factory = read(&self.factories)
            .get(platform)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(platform.to_string()))?;
        let config = self
            .get_config(platform)
            .ok_or_else(|| RegistryError::NotConfigured(platform.to_string()))?;
        if !config.enabled {
            return Err(RegistryError::Disabled(platform.to_string()));
        }
        factory(config).map_err(|source| RegistryError::Factory {
            platform: platform.to_string(),
            source,
        })
    }
}

fn github(cfg: ConnectorConfig) -> anyhow::Result<Arc<dyn PlatformConnector>> {
    Ok(Arc::new(GitHubConnector::new(cfg)?))
}

fn slack(cfg: ConnectorConfig) -> anyhow::Result<Arc<dyn PlatformConnector>> {
    Ok(Arc::new(SlackConnector::new(cfg)?))
}

fn discord(cfg: ConnectorConfig) -> anyhow::Result<Arc<dyn PlatformConnector>> {
    Ok(Arc::new(DiscordConnector::new(cfg)?))
}

// ═══════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════

/// The live set of instantiated connectors.
///
/// Each connector gets a child of the manager's root cancellation token;
/// [`remove`](Self::remove) cancels only that child and
/// [`shutdown`](Self::shutdown) cancels the root.
pub struct ConnectorManager {
    connectors: RwLock<HashMap<String, ManagedConnector>>,
    root: CancellationToken,
}

#[derive(Clone)]
struct ManagedConnector {
    connector: Arc<dyn PlatformConnector>,
    cancel: CancellationToken,
}

/// Outcome of [`ConnectorManager::initialize`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Create every registered, configured, enabled connector.
    ///
    /// A failing platform is recorded in the report and does not prevent
    /// the others from starting.
    pub fn initialize(&self, registry: &ConnectorRegistry) -> InitReport {
        let mut report = InitReport::default();
        for platform in registry.platforms() {
            match registry.create_connector(&platform) {
                Ok(connector) => {
                    self.insert(&platform, connector);
                    tracing::info!(platform = %platform, "connector started");
                    report.started.push(platform);
                }
                Err(RegistryError::NotConfigured(_)) | Err(RegistryError::Disabled(_)) => {
                    tracing::debug!(platform = %platform, "connector not enabled");
                    report.skipped.push(platform);
                }
                Err(e) => {
                    tracing::warn!(platform = %platform, error = %e, "connector failed to start");
                    report.failed.push((platform, e.to_string()));
                }
            }
        }
        report
    }

    /// Add or replace a live connector.
    pub fn insert(&self, platform: &str, connector: Arc<dyn PlatformConnector>) {
        let managed = ManagedConnector {
            connector,
            cancel: self.root.child_token(),
        };
        if let Some(previous) = write(&self.connectors).insert(platform.to_string(), managed) {
            previous.cancel.cancel();
        }
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformConnector>> {
        read(&self.connectors)
            .get(platform)
            .map(|m| m.connector.clone())
    }

    /// Cancellation token scoped to one live connector.
    pub fn cancel_token(&self, platform: &str) -> Option<CancellationToken> {
        read(&self.connectors).get(platform).map(|m| m.cancel.clone())
    }

    /// Live platform names, sorted.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.connectors).keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop one connector and cancel its in-flight work.
    pub fn remove(&self, platform: &str) -> bool {
        match write(&self.connectors).remove(platform) {
            Some(managed) => {
                managed.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything and drop every connector reference.
    pub fn shutdown(&self) {
        self.root.cancel();
        write(&self.connectors).clear();
        tracing::info!("connector manager shut down");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
