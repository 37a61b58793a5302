//! Wiring for the `sync` and `run` commands.
//!
//! [`Runtime::build`] opens the database, loads every configured connector
//! and assembles the [`IngestionOrchestrator`]. `sync` runs one cycle per
//! (tenant, platform) and prints a summary; `run` keeps the workers going
//! until Ctrl-C.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, TenantConfig};
use crate::context::build_processor;
use crate::db;
use crate::migrate;
use crate::orchestrator::{CycleError, IngestionOrchestrator};
use crate::registry::{ConnectorManager, ConnectorRegistry, InitReport};
use crate::server;
use crate::store::sqlite::SqliteStore;

pub struct Runtime {
    pub registry: Arc<ConnectorRegistry>,
    pub manager: Arc<ConnectorManager>,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub init: InitReport,
}

impl Runtime {
    /// Open the store and start every enabled connector.
    ///
    /// With `full`, checkpoints are ignored for this process and every
    /// connector fetches from its lookback floor.
    pub async fn build(config: &Config, full: bool) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));

        let registry = Arc::new(ConnectorRegistry::from_config(config));
        if full {
            for platform in registry.platforms() {
                if let Some(mut cfg) = registry.get_config(&platform) {
                    cfg.sync_config.incremental_sync = false;
                    registry.set_config(cfg)?;
                }
            }
        }

        let manager = Arc::new(ConnectorManager::new());
        let init = manager.initialize(&registry);

        let processor = build_processor(&config.context_processor)?;
        let orchestrator = Arc::new(IngestionOrchestrator::new(
            registry.clone(),
            manager.clone(),
            store.clone(),
            processor,
            config.tenants.clone(),
            &config.orchestrator,
        ));

        Ok(Self {
            registry,
            manager,
            store,
            orchestrator,
            init,
        })
    }

    fn tenants<'a>(&self, config: &'a Config, tenant: Option<&str>) -> Result<Vec<&'a TenantConfig>> {
        match tenant {
            Some(id) => match config.tenants.iter().find(|t| t.id == id) {
                Some(t) => Ok(vec![t]),
                None => bail!("Unknown tenant: '{}'", id),
            },
            None => Ok(config.tenants.iter().collect()),
        }
    }

    async fn close(&self) {
        self.manager.shutdown();
        self.store.pool().close().await;
    }
}

/// One sync cycle per selected (tenant, platform) pair.
pub async fn run_sync(
    config: &Config,
    platform: Option<&str>,
    tenant: Option<&str>,
    full: bool,
) -> Result<()> {
    let runtime = Runtime::build(config, full).await?;
    for (name, reason) in &runtime.init.failed {
        eprintln!("warning: {} not started: {}", name, reason);
    }

    let started = runtime.manager.platforms();
    let platforms: Vec<String> = match platform {
        Some(p) if started.iter().any(|s| s == p) => vec![p.to_string()],
        Some(p) => {
            runtime.close().await;
            bail!(
                "Connector '{}' is not running. Running: {}",
                p,
                if started.is_empty() {
                    "none".to_string()
                } else {
                    started.join(", ")
                }
            );
        }
        None => started,
    };
    let tenants = runtime.tenants(config, tenant)?;

    let cancel = runtime.manager.shutdown_token();
    let mut failures = 0usize;
    for t in tenants {
        for p in platforms.iter().filter(|p| t.syncs(p)) {
            println!("sync {}/{}", t.id, p);
            match runtime.orchestrator.run_cycle(t, p, &cancel).await {
                Ok(report) => {
                    if let Some(since) = report.since {
                        println!("  since: {}", since.to_rfc3339());
                    }
                    println!("  fetched: {} events", report.fetched);
                    println!("  persisted: {} events", report.persisted);
                    if report.failed > 0 {
                        println!("  failed: {} events", report.failed);
                    }
                    println!("  entities written: {}", report.entities);
                    println!("  relationships written: {}", report.relationships);
                    match report.checkpoint {
                        Some(cp) => println!("  checkpoint: {}", cp.to_rfc3339()),
                        None => println!("  checkpoint: none"),
                    }
                    println!("ok");
                }
                Err(e) => {
                    failures += 1;
                    let hint = match &e {
                        CycleError::Retryable { .. } => " (retryable)",
                        _ => "",
                    };
                    println!("  error: {}{}", e, hint);
                }
            }
        }
    }

    runtime.close().await;
    if failures > 0 {
        bail!("{} sync(s) failed", failures);
    }
    Ok(())
}

/// Run every sync worker until Ctrl-C. With `serve`, the query API runs
/// alongside on `[server].bind`.
pub async fn run_daemon(config: &Config, serve: bool) -> Result<()> {
    let runtime = Runtime::build(config, false).await?;
    for (name, reason) in &runtime.init.failed {
        tracing::warn!(platform = %name, error = %reason, "connector not started");
    }
    if runtime.manager.platforms().is_empty() {
        runtime.close().await;
        bail!("No connectors are enabled; nothing to run");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C");
        }
        signal.cancel();
    });

    let server = if serve {
        let store = runtime.store.clone();
        let config = config.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            server::serve(&config, store, token).await
        }))
    } else {
        None
    };

    runtime.orchestrator.clone().run(shutdown.clone()).await?;
    shutdown.cancel();

    if let Some(handle) = server {
        handle.await??;
    }
    runtime.close().await;
    Ok(())
}
