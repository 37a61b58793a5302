//! Ingestion orchestrator.
//!
//! Runs one worker per (tenant, platform) pair. Each worker loops over sync
//! cycles:
//!
//! ```text
//! Idle ──▶ Fetching ──▶ Normalizing ──▶ Persisting ──▶ Idle
//!             │                             │
//!             └──────────▶ Failed ◀─────────┘   (retry after backoff,
//!                            │                    checkpoint untouched)
//!                            ▼
//!                        Disabled                (non-retryable error)
//! ```
//!
//! A cycle reads the checkpoint, fetches up to `batch_size` events since
//! then, normalizes them, hands them to the context processor, and persists
//! the result one event at a time. A failing event is logged and skipped.
//! The checkpoint advances to the newest event
//! [`position`](PlatformEvent::position) only after the whole batch has
//! been processed, so replays are absorbed by upsert deduplication rather
//! than lost. Connectors return the oldest events since the checkpoint, so
//! nothing left out of a batch sits behind it.
//!
//! Workers share a semaphore capping how many cycles run at once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectorConfig, OrchestratorConfig, TenantConfig};
use crate::context::{ContextProcessor, KnowledgeObject, ProcessRequest};
use crate::error::{ConnectorError, ErrorCode};
use crate::models::AuthResult;
use crate::rate_limit::Backoff;
use crate::registry::{ConnectorManager, ConnectorRegistry};
use crate::store::{GraphStore, StoreError};
use crate::traits::PlatformConnector;

/// Events per cycle when `sync_config.batch_size` is zero.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Identifies one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SyncKey {
    pub tenant: String,
    pub platform: String,
}

impl SyncKey {
    pub fn new(tenant: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            platform: platform.into(),
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Persisting,
    Failed,
    Disabled,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub tenant: String,
    pub platform: String,
    pub since: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub normalized: usize,
    /// Events whose entities and relationships were all stored.
    pub persisted: usize,
    /// Events skipped because something failed to store.
    pub failed: usize,
    pub entities: usize,
    pub relationships: usize,
    /// Checkpoint after the cycle.
    pub checkpoint: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub state: SyncState,
    pub last_error: Option<ConnectorError>,
    pub last_report: Option<CycleReport>,
    pub consecutive_failures: u32,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{error}")]
    Retryable {
        error: ConnectorError,
        retry_after: Option<Duration>,
    },
    #[error("{0}")]
    Fatal(ConnectorError),
    #[error("cycle cancelled")]
    Cancelled,
    #[error("persistence failed: {0}")]
    Persistence(anyhow::Error),
}

impl From<ConnectorError> for CycleError {
    fn from(error: ConnectorError) -> Self {
        if error.is_cancelled() {
            CycleError::Cancelled
        } else if error.retryable {
            CycleError::Retryable {
                retry_after: error.retry_after,
                error,
            }
        } else {
            CycleError::Fatal(error)
        }
    }
}

impl From<StoreError> for CycleError {
    fn from(error: StoreError) -> Self {
        CycleError::Persistence(error.into())
    }
}

pub struct IngestionOrchestrator {
    registry: Arc<ConnectorRegistry>,
    manager: Arc<ConnectorManager>,
    store: Arc<dyn GraphStore>,
    processor: Arc<dyn ContextProcessor>,
    tenants: Vec<TenantConfig>,
    permits: Arc<Semaphore>,
    shutdown_grace: Duration,
    status: RwLock<HashMap<SyncKey, WorkerStatus>>,
}

impl IngestionOrchestrator {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        manager: Arc<ConnectorManager>,
        store: Arc<dyn GraphStore>,
        processor: Arc<dyn ContextProcessor>,
        tenants: Vec<TenantConfig>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            store,
            processor,
            tenants,
            permits: Arc::new(Semaphore::new(config.max_concurrent_syncs.max(1))),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            status: RwLock::new(HashMap::new()),
        }
    }

    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }

    /// Every (tenant, platform) pair with a live connector.
    pub fn sync_keys(&self) -> Vec<SyncKey> {
        let platforms = self.manager.platforms();
        let mut keys: Vec<SyncKey> = self
            .tenants
            .iter()
            .flat_map(|t| {
                platforms
                    .iter()
                    .filter(|p| t.syncs(p))
                    .map(|p| SyncKey::new(&t.id, p))
            })
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of every worker's status, sorted by key.
    pub fn status(&self) -> Vec<(SyncKey, WorkerStatus)> {
        let mut all: Vec<_> = self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn status_of(&self, key: &SyncKey) -> Option<WorkerStatus> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn update(&self, key: &SyncKey, f: impl FnOnce(&mut WorkerStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(status.entry(key.clone()).or_default());
    }

    fn set_state(&self, key: &SyncKey, state: SyncState) {
        self.update(key, |s| s.state = state);
    }

    fn config_for(&self, platform: &str) -> ConnectorConfig {
        self.registry
            .get_config(platform)
            .unwrap_or_else(|| ConnectorConfig::with_defaults(platform))
    }

    fn connector(&self, platform: &str) -> Result<Arc<dyn PlatformConnector>, CycleError> {
        self.manager.get(platform).ok_or_else(|| {
            CycleError::Fatal(ConnectorError::new(
                platform,
                ErrorCode::NotFound,
                "connector is not running",
            ))
        })
    }

    /// Validate the platform's configured credentials.
    pub async fn authenticate(
        &self,
        platform: &str,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, CycleError> {
        let connector = self.connector(platform)?;
        let config = self.config_for(platform);
        Ok(connector.authenticate(&config.auth_config, cancel).await?)
    }

    /// Run a single sync cycle for `tenant` on `platform`.
    pub async fn run_cycle(
        &self,
        tenant: &TenantConfig,
        platform: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let key = SyncKey::new(&tenant.id, platform);
        let connector = self.connector(platform)?;
        let config = self.config_for(platform);
        let sync = &config.sync_config;

        // ── Fetching ──
        self.set_state(&key, SyncState::Fetching);
        let checkpoint = if sync.incremental_sync {
            self.store.get_checkpoint(&tenant.id, platform).await?
        } else {
            None
        };
        let floor = sync
            .lookback()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() - d);
        let since = match (checkpoint, floor) {
            (Some(c), Some(f)) => c.max(f),
            (Some(c), None) => c,
            (None, Some(f)) => f,
            (None, None) => DateTime::<Utc>::UNIX_EPOCH,
        };

        tracing::debug!(tenant = %tenant.id, platform, since = %since, "fetching");
        let limit = match sync.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        };
        let events = connector.fetch_events(since, limit, cancel).await?;

        // ── Normalizing ──
        self.set_state(&key, SyncState::Normalizing);
        let normalized = connector.normalize_data(&events);

        // ── Persisting ──
        self.set_state(&key, SyncState::Persisting);
        let mut report = CycleReport {
            tenant: tenant.id.clone(),
            platform: platform.to_string(),
            since: Some(since),
            fetched: events.len(),
            normalized: normalized.len(),
            ..CycleReport::default()
        };

        if !normalized.is_empty() {
            let request = ProcessRequest {
                tenant: tenant.id.clone(),
                project: tenant.project.clone(),
                events: normalized,
            };
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Err(CycleError::Cancelled),
                r = self.processor.process(&request) => r.map_err(CycleError::Persistence)?,
            };

            for object in &batch.objects {
                if cancel.is_cancelled() {
                    return Err(CycleError::Cancelled);
                }
                match self.persist(&tenant.project, object).await {
                    Ok((entities, relationships)) => {
                        report.persisted += 1;
                        report.entities += entities;
                        report.relationships += relationships;
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            tenant = %tenant.id,
                            platform,
                            event = %object.event_id,
                            error = %e,
                            "failed to persist event"
                        );
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        report.checkpoint = match events.iter().map(|e| e.position()).max() {
            Some(latest) => Some(
                self.store
                    .advance_checkpoint(&tenant.id, platform, latest)
                    .await?,
            ),
            None => checkpoint,
        };

        self.update(&key, |s| {
            s.state = SyncState::Idle;
            s.last_report = Some(report.clone());
        });
        tracing::info!(
            tenant = %tenant.id,
            platform,
            fetched = report.fetched,
            persisted = report.persisted,
            failed = report.failed,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Entities first, then relationships. The first failure aborts this
    /// event only.
    async fn persist(
        &self,
        project: &str,
        object: &KnowledgeObject,
    ) -> Result<(usize, usize), StoreError> {
        for entity in &object.entities {
            self.store.upsert_entity(project, entity).await?;
        }
        for relationship in &object.relationships {
            self.store.upsert_relationship(project, relationship).await?;
        }
        Ok((object.entities.len(), object.relationships.len()))
    }

    /// Run every worker until `shutdown` fires or every worker has stopped.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut workers = JoinSet::new();
        for key in self.sync_keys() {
            let Some(token) = self.manager.cancel_token(&key.platform) else {
                continue;
            };
            let orchestrator = self.clone();
            workers.spawn(async move { orchestrator.worker(key, token.child_token()).await });
        }
        tracing::info!(workers = workers.len(), "orchestrator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(Err(e)) => tracing::error!(error = %e, "sync worker panicked"),
                    Some(Ok(())) => {}
                    None => {
                        tracing::info!("all sync workers stopped");
                        return Ok(());
                    }
                },
            }
        }

        tracing::info!("shutting down sync workers");
        self.manager.shutdown();
        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!("sync workers did not stop within the grace period");
            workers.abort_all();
        }
        Ok(())
    }

    async fn worker(&self, key: SyncKey, cancel: CancellationToken) {
        let Some(tenant) = self.tenant(&key.tenant).cloned() else {
            return;
        };
        let Ok(connector) = self.connector(&key.platform) else {
            return;
        };
        let config = self.config_for(&key.platform);
        let max_retries = config.rate_limit.max_retries;
        let mut backoff = Backoff::new(config.rate_limit.backoff_multiplier.max(1.0));

        match self.authenticate(&key.platform, &cancel).await {
            Ok(auth) => {
                tracing::info!(sync = %key, user = %auth.user_id, "authenticated");
            }
            Err(CycleError::Cancelled) => return,
            Err(CycleError::Fatal(error)) => {
                self.disable(&key, error);
                return;
            }
            Err(e) => tracing::warn!(sync = %key, error = %e, "authentication check failed, continuing"),
        }

        let mut last_success: Option<DateTime<Utc>> = None;
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                p = self.permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let result = self.run_cycle(&tenant, &key.platform, &cancel).await;
            drop(permit);

            let delay = match result {
                Ok(_) => {
                    backoff.reset();
                    last_success = Some(Utc::now());
                    self.update(&key, |s| {
                        s.consecutive_failures = 0;
                        s.last_error = None;
                    });
                    connector.schedule_sync(last_success)
                }
                Err(CycleError::Cancelled) => break,
                Err(CycleError::Fatal(error)) => {
                    self.disable(&key, error);
                    break;
                }
                Err(CycleError::Retryable { error, retry_after }) => {
                    self.retry_delay(&key, Some(error), retry_after, &mut backoff, max_retries)
                        .unwrap_or_else(|| connector.schedule_sync(last_success))
                }
                Err(CycleError::Persistence(e)) => {
                    tracing::warn!(sync = %key, error = %e, "persistence failed");
                    self.retry_delay(&key, None, None, &mut backoff, max_retries)
                        .unwrap_or_else(|| connector.schedule_sync(last_success))
                }
            };

            let next = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
            self.update(&key, |s| s.next_run_at = next);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.update(&key, |s| {
            if s.state != SyncState::Disabled {
                s.state = SyncState::Idle;
            }
            s.next_run_at = None;
        });
        tracing::debug!(sync = %key, "worker stopped");
    }

    /// Record a failed cycle. Returns the retry delay, or `None` once
    /// `max_retries` consecutive retries are used up and the worker should
    /// fall back to its normal interval.
    fn retry_delay(
        &self,
        key: &SyncKey,
        error: Option<ConnectorError>,
        retry_after: Option<Duration>,
        backoff: &mut Backoff,
        max_retries: u32,
    ) -> Option<Duration> {
        let mut failures = 0;
        self.update(key, |s| {
            s.state = SyncState::Failed;
            s.consecutive_failures += 1;
            if error.is_some() {
                s.last_error = error;
            }
            failures = s.consecutive_failures;
        });

        if backoff.failures() >= max_retries {
            tracing::warn!(sync = %key, failures, "retries exhausted, waiting for next interval");
            backoff.reset();
            return None;
        }
        let computed = backoff.next_delay();
        let delay = retry_after.unwrap_or(computed);
        tracing::warn!(sync = %key, failures, delay_secs = delay.as_secs_f64(), "cycle failed, retrying");
        Some(delay)
    }

    fn disable(&self, key: &SyncKey, error: ConnectorError) {
        tracing::error!(sync = %key, code = %error.code, error = %error.message, "disabling sync");
        self.update(key, |s| {
            s.state = SyncState::Disabled;
            s.consecutive_failures += 1;
            s.last_error = Some(error);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::context::HeuristicProcessor;
    use crate::models::{
        AuthType, EventType, NormalizedEvent, PlatformEvent, PlatformInfo, RateLimitEnvelope,
        PLATFORM_GITHUB,
    };
    use crate::store::memory::InMemoryStore;
    use crate::store::{CheckpointStore, EntityKind, KnowledgeStore, NaturalKey};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ─── Helpers ───

    struct MockConnector {
        events: Vec<PlatformEvent>,
        failures: Mutex<Vec<ConnectorError>>,
        seen_since: Mutex<Vec<DateTime<Utc>>>,
        fetch_delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockConnector {
        fn new(events: Vec<PlatformEvent>) -> Self {
            Self {
                events,
                failures: Mutex::new(Vec::new()),
                seen_since: Mutex::new(Vec::new()),
                fetch_delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn failing(self, errors: Vec<ConnectorError>) -> Self {
            *self.failures.lock().unwrap() = errors;
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.fetch_delay = delay;
            self
        }
    }

    #[async_trait]
    impl PlatformConnector for MockConnector {
        async fn authenticate(
            &self,
            _auth: &AuthConfig,
            _cancel: &CancellationToken,
        ) -> Result<AuthResult, ConnectorError> {
            Ok(AuthResult {
                access_token: "token".into(),
                user_id: "bot".into(),
                user_name: None,
                expires_at: None,
                scopes: vec![],
            })
        }

        async fn fetch_events(
            &self,
            since: DateTime<Utc>,
            limit: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<PlatformEvent>, ConnectorError> {
            if cancel.is_cancelled() {
                return Err(ConnectorError::cancelled(PLATFORM_GITHUB));
            }
            self.seen_since.lock().unwrap().push(since);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.fetch_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(e) = self.failures.lock().unwrap().pop() {
                return Err(e);
            }
            let mut out: Vec<PlatformEvent> = self
                .events
                .iter()
                .filter(|e| e.timestamp >= since)
                .cloned()
                .collect();
            out.truncate(limit);
            Ok(out)
        }

        fn normalize_data(&self, events: &[PlatformEvent]) -> Vec<NormalizedEvent> {
            crate::normalize::normalize_all(events)
        }

        fn schedule_sync(&self, _last_sync: Option<DateTime<Utc>>) -> Duration {
            Duration::from_millis(20)
        }

        fn get_platform_info(&self) -> PlatformInfo {
            PlatformInfo {
                name: PLATFORM_GITHUB.into(),
                display_name: "Mock".into(),
                supported_events: vec![EventType::PullRequest],
                rate_limit: RateLimitEnvelope {
                    requests_per_hour: 3600,
                    requests_per_minute: 60,
                    burst_limit: 10,
                },
                auth_type: AuthType::PersonalAccessToken,
                required_scopes: vec![],
                default_sync_interval: Duration::from_millis(20),
            }
        }
    }

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap()
    }

    fn pr(n: i64) -> PlatformEvent {
        PlatformEvent {
            id: format!("acme/web/pull/{}", n),
            event_type: EventType::PullRequest,
            timestamp: at(n),
            anchor: None,
            author: "alice".into(),
            content: "Touches src/auth/session.rs".into(),
            title: Some(format!("PR {}", n)),
            metadata: json!({ "files": ["src/auth/session.rs"] }),
            references: vec![],
            platform: PLATFORM_GITHUB.into(),
        }
    }

    fn tenant() -> TenantConfig {
        tenant_named("acme")
    }

    fn tenant_named(id: &str) -> TenantConfig {
        TenantConfig {
            id: id.into(),
            project: "acme/web".into(),
            platforms: vec![],
        }
    }

    fn orchestrator(
        connector: Arc<MockConnector>,
        store: Arc<InMemoryStore>,
    ) -> Arc<IngestionOrchestrator> {
        orchestrator_with(connector, store, vec![tenant()], &OrchestratorConfig::default())
    }

    fn orchestrator_with(
        connector: Arc<MockConnector>,
        store: Arc<InMemoryStore>,
        tenants: Vec<TenantConfig>,
        config: &OrchestratorConfig,
    ) -> Arc<IngestionOrchestrator> {
        let registry = Arc::new(ConnectorRegistry::new());
        let mut connector_config = ConnectorConfig::with_defaults(PLATFORM_GITHUB);
        connector_config.rate_limit.max_retries = 2;
        registry.set_config(connector_config).unwrap();
        let manager = Arc::new(ConnectorManager::new());
        manager.insert(PLATFORM_GITHUB, connector);
        Arc::new(IngestionOrchestrator::new(
            registry,
            manager,
            store,
            Arc::new(HeuristicProcessor),
            tenants,
            config,
        ))
    }

    // ─── Tests ───

    #[test]
    fn test_connector_errors_map_to_cycle_errors() {
        let rate = ConnectorError::new("github", ErrorCode::RateLimit, "slow")
            .with_retry_after(Some(Duration::from_secs(4)));
        match CycleError::from(rate) {
            CycleError::Retryable { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(4)))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            CycleError::from(ConnectorError::auth("github", "bad token")),
            CycleError::Fatal(_)
        ));
        assert!(matches!(
            CycleError::from(ConnectorError::cancelled("github")),
            CycleError::Cancelled
        ));
    }

    #[test]
    fn test_sync_key_display() {
        assert_eq!(SyncKey::new("acme", "slack").to_string(), "acme/slack");
    }

    #[tokio::test]
    async fn test_cycle_persists_and_advances_checkpoint() {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(MockConnector::new(vec![pr(1), pr(2), pr(3)]));
        let orch = orchestrator(connector, store.clone());
        let cancel = CancellationToken::new();

        let report = orch.run_cycle(&tenant(), PLATFORM_GITHUB, &cancel).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.persisted, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.checkpoint, Some(at(3)));
        assert_eq!(
            store.get_checkpoint("acme", PLATFORM_GITHUB).await.unwrap(),
            Some(at(3))
        );

        let pr1 = NaturalKey::new(PLATFORM_GITHUB, "acme/web/pull/1", EntityKind::Decision);
        assert!(store
            .get_entity_history("acme/web", &pr1)
            .await
            .unwrap()
            .is_some());
        let status = orch.status_of(&SyncKey::new("acme", PLATFORM_GITHUB)).unwrap();
        assert_eq!(status.state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(MockConnector::new(vec![pr(1), pr(2)]));
        let orch = orchestrator(connector.clone(), store.clone());
        let cancel = CancellationToken::new();

        orch.run_cycle(&tenant(), PLATFORM_GITHUB, &cancel).await.unwrap();
        let entities = store.entity_count("acme/web").await.unwrap();
        let edges = store.relationship_count("acme/web").await.unwrap();

        // The newest event is at the checkpoint and is fetched again.
        let second = orch.run_cycle(&tenant(), PLATFORM_GITHUB, &cancel).await.unwrap();
        assert_eq!(second.fetched, 1);
        assert_eq!(store.entity_count("acme/web").await.unwrap(), entities);
        assert_eq!(store.relationship_count("acme/web").await.unwrap(), edges);

        let since = connector.seen_since.lock().unwrap().clone();
        assert_eq!(since[1], at(2));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_checkpoint_untouched() {
        let store = Arc::new(InMemoryStore::new());
        store
            .advance_checkpoint("acme", PLATFORM_GITHUB, at(1))
            .await
            .unwrap();
        let connector = Arc::new(
            MockConnector::new(vec![pr(5)])
                .failing(vec![ConnectorError::network(PLATFORM_GITHUB, "reset")]),
        );
        let orch = orchestrator(connector, store.clone());

        let err = orch
            .run_cycle(&tenant(), PLATFORM_GITHUB, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Retryable { .. }));
        assert_eq!(
            store.get_checkpoint("acme", PLATFORM_GITHUB).await.unwrap(),
            Some(at(1))
        );
        assert_eq!(store.entity_count("acme/web").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_does_not_advance() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(Arc::new(MockConnector::new(vec![pr(1)])), store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch
            .run_cycle(&tenant(), PLATFORM_GITHUB, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Cancelled));
        assert_eq!(store.get_checkpoint("acme", PLATFORM_GITHUB).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_cycle_keeps_checkpoint() {
        let store = Arc::new(InMemoryStore::new());
        store
            .advance_checkpoint("acme", PLATFORM_GITHUB, at(10))
            .await
            .unwrap();
        let orch = orchestrator(Arc::new(MockConnector::new(vec![pr(1)])), store.clone());
        let report = orch
            .run_cycle(&tenant(), PLATFORM_GITHUB, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.checkpoint, Some(at(10)));
    }

    #[tokio::test]
    async fn test_worker_disables_on_fatal_error() {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(
            MockConnector::new(vec![pr(1)])
                .failing(vec![ConnectorError::auth(PLATFORM_GITHUB, "revoked")]),
        );
        let orch = orchestrator(connector, store);

        // Every worker stops on its own, so run returns without a signal.
        tokio::time::timeout(Duration::from_secs(5), orch.clone().run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();

        let status = orch.status_of(&SyncKey::new("acme", PLATFORM_GITHUB)).unwrap();
        assert_eq!(status.state, SyncState::Disabled);
        assert_eq!(status.last_error.unwrap().code, ErrorCode::AuthError);
    }

    #[tokio::test]
    async fn test_worker_retries_then_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(MockConnector::new(vec![pr(1)]).failing(vec![
            ConnectorError::new(PLATFORM_GITHUB, ErrorCode::RateLimit, "slow")
                .with_retry_after(Some(Duration::from_millis(10))),
        ]));
        let orch = orchestrator(connector.clone(), store.clone());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(orch.clone().run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get_checkpoint("acme", PLATFORM_GITHUB).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(connector.seen_since.lock().unwrap().len() >= 2);
        let status = orch.status_of(&SyncKey::new("acme", PLATFORM_GITHUB)).unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_ne!(status.state, SyncState::Disabled);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_are_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let connector =
            Arc::new(MockConnector::new(vec![pr(1)]).slow(Duration::from_millis(30)));
        let tenants: Vec<TenantConfig> =
            (0..6).map(|i| tenant_named(&format!("t{}", i))).collect();
        let config = OrchestratorConfig {
            max_concurrent_syncs: 2,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator_with(connector.clone(), store.clone(), tenants, &config);
        assert_eq!(orch.sync_keys().len(), 6);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(orch.clone().run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut done = 0;
                for i in 0..6 {
                    let id = format!("t{}", i);
                    if store.get_checkpoint(&id, PLATFORM_GITHUB).await.unwrap().is_some() {
                        done += 1;
                    }
                }
                if done == 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let max = connector.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=2).contains(&max), "max in flight was {}", max);
    }
}
