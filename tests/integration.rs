//! End-to-end tests: a mock GitHub API, a SQLite database in a temp dir,
//! the orchestrator, the read API, and the `ksync` binary.

use axum::{extract::Query, routing::get, Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use knowledge_sync::config::{load_config, Config};
use knowledge_sync::ingest::Runtime;
use knowledge_sync::server;
use knowledge_sync::store::{
    CheckpointStore, Direction, EntityKind, KnowledgeRelationship, KnowledgeStore, NaturalKey,
    RelationshipKind, StoreError,
};

// ─── Helpers ────────────────────────────────────────────────────────

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn t(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

async fn pulls(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    if q.get("page").map(String::as_str) != Some("1") {
        return Json(json!([]));
    }
    Json(json!([
        {
            "number": 12,
            "title": "Shorten session refresh window",
            "body": "Closes #7. Moves refresh into the middleware.",
            "state": "closed",
            "user": { "login": "alice", "id": 1 },
            "labels": [{ "name": "auth" }],
            "created_at": t(8),
            "updated_at": t(10),
            "merged_at": t(10),
            "head": { "ref": "feature/session-refresh" },
            "base": { "ref": "main" },
        }
    ]))
}

async fn pull_files() -> Json<Value> {
    Json(json!([{ "filename": "src/auth/session.rs" }]))
}

async fn issues(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    if q.get("page").map(String::as_str) != Some("1") {
        return Json(json!([]));
    }
    Json(json!([
        {
            "number": 7,
            "title": "Sessions expire too early",
            "body": "Users are logged out after 5 minutes, see src/auth/session.rs",
            "state": "closed",
            "user": { "login": "bob", "id": 2 },
            "labels": [{ "name": "bug" }],
            "comments": 4,
            "created_at": t(6),
            "updated_at": t(9),
        }
    ]))
}

async fn commits() -> Json<Value> {
    Json(json!([]))
}

async fn user() -> Json<Value> {
    Json(json!({ "login": "sync-bot", "id": 99 }))
}

async fn github_mock() -> String {
    spawn(
        Router::new()
            .route("/user", get(user))
            .route("/repos/{owner}/{repo}/pulls", get(pulls))
            .route("/repos/{owner}/{repo}/pulls/{number}/files", get(pull_files))
            .route("/repos/{owner}/{repo}/issues", get(issues))
            .route("/repos/{owner}/{repo}/commits", get(commits)),
    )
    .await
}

fn write_config(root: &Path, github_base: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let content = format!(
        r#"[db]
path = "{root}/data/ksync.sqlite"

[server]
bind = "127.0.0.1:0"

[[tenants]]
id = "acme"
project = "acme/web"
platforms = ["github"]

[[tenants]]
id = "beta"
project = "beta/web"
platforms = ["slack"]

[connectors.github]
enabled = true

[connectors.github.auth_config.metadata]
token = "ghp_integration_token"
repositories = "acme/web"

[connectors.github.metadata]
api_base_url = "{github_base}"
"#,
        root = root.display(),
        github_base = github_base,
    );

    let path = config_dir.join("ksync.toml");
    fs::write(&path, content).unwrap();
    path
}

async fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let base = github_mock().await;
    let path = write_config(tmp.path(), &base);
    let config = load_config(&path).unwrap();
    (tmp, config)
}

fn run_ksync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_ksync"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run ksync");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

// ─── Pipeline ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_cycle_builds_graph_and_is_idempotent() {
    let (_tmp, config) = setup().await;
    let runtime = Runtime::build(&config, false).await.unwrap();
    assert_eq!(runtime.init.started, vec!["github".to_string()]);

    let tenant = runtime.orchestrator.tenant("acme").unwrap().clone();
    let cancel = CancellationToken::new();

    let first = runtime
        .orchestrator
        .run_cycle(&tenant, "github", &cancel)
        .await
        .unwrap();
    assert_eq!(first.fetched, 2);
    assert_eq!(first.persisted, 2);
    assert_eq!(first.failed, 0);
    assert_eq!(first.checkpoint, Some(t(10)));

    let store = runtime.store.clone();
    let entities = store.entity_count("acme/web").await.unwrap();
    let relationships = store.relationship_count("acme/web").await.unwrap();
    assert!(entities > 0 && relationships > 0);

    // Re-observing the same events changes nothing.
    let second = runtime
        .orchestrator
        .run_cycle(&tenant, "github", &cancel)
        .await
        .unwrap();
    assert!(second.fetched >= 1);
    assert_eq!(store.entity_count("acme/web").await.unwrap(), entities);
    assert_eq!(
        store.relationship_count("acme/web").await.unwrap(),
        relationships
    );

    // File context: the pull request modified it, the issue discussed it.
    let ctx = store
        .get_context_for_file("acme/web", "session.rs", 20)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ctx.file.platform_id, "src/auth/session.rs");
    assert!(ctx.related.iter().any(|r| r.entity.kind == EntityKind::Decision
        && r.relationship == RelationshipKind::ModifiedBy
        && r.direction == Direction::Outgoing));
    assert!(ctx.related.iter().any(|r| r.entity.kind == EntityKind::Discussion
        && r.relationship == RelationshipKind::DiscussedIn));

    // Decision history for the feature the issue anchors.
    let decisions = store.get_decision_history("acme/web", "#7").await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].platform_id, "acme/web/pull/12");

    // History of the pull request has exactly one revision.
    let key = NaturalKey::new("github", "acme/web/pull/12", EntityKind::Decision);
    let history = store
        .get_entity_history("acme/web", &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.revisions.len(), 1);

    store.pool().close().await;
}

#[tokio::test]
async fn test_projects_are_isolated() {
    let (_tmp, config) = setup().await;
    let runtime = Runtime::build(&config, false).await.unwrap();
    let acme = runtime.orchestrator.tenant("acme").unwrap().clone();
    runtime
        .orchestrator
        .run_cycle(&acme, "github", &CancellationToken::new())
        .await
        .unwrap();

    let store = runtime.store.clone();
    assert!(store.entity_count("acme/web").await.unwrap() > 0);
    assert_eq!(store.entity_count("beta/web").await.unwrap(), 0);
    assert!(store
        .search_by_query("beta/web", "session refresh", 10)
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .get_context_for_file("beta/web", "src/auth/session.rs", 10)
        .await
        .unwrap()
        .is_none());

    // Only tenant/platform pairs the config asks for get workers.
    let keys = runtime.orchestrator.sync_keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].tenant, "acme");

    store.pool().close().await;
}

#[tokio::test]
async fn test_dangling_relationship_is_rejected() {
    let (_tmp, config) = setup().await;
    let runtime = Runtime::build(&config, false).await.unwrap();
    let store = runtime.store.clone();

    let before = store.relationship_count("acme/web").await.unwrap();
    let err = store
        .upsert_relationship(
            "acme/web",
            &KnowledgeRelationship::new(
                NaturalKey::file("src/missing.rs"),
                RelationshipKind::ModifiedBy,
                NaturalKey::new("github", "acme/web/pull/404", EntityKind::Decision),
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DanglingRelationship { .. }));
    assert_eq!(store.relationship_count("acme/web").await.unwrap(), before);

    store.pool().close().await;
}

#[tokio::test]
async fn test_checkpoint_is_per_tenant_and_monotonic() {
    let (_tmp, config) = setup().await;
    let runtime = Runtime::build(&config, false).await.unwrap();
    let store = runtime.store.clone();

    store.advance_checkpoint("acme", "github", t(10)).await.unwrap();
    let kept = store.advance_checkpoint("acme", "github", t(5)).await.unwrap();
    assert_eq!(kept, t(10));
    assert_eq!(store.get_checkpoint("beta", "github").await.unwrap(), None);

    store.pool().close().await;
}

// ─── Read API ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_api_serves_synced_graph() {
    let (_tmp, config) = setup().await;
    let runtime = Runtime::build(&config, false).await.unwrap();
    let acme = runtime.orchestrator.tenant("acme").unwrap().clone();
    runtime
        .orchestrator
        .run_cycle(&acme, "github", &CancellationToken::new())
        .await
        .unwrap();

    let store: Arc<dyn KnowledgeStore> = runtime.store.clone();
    let base = spawn(server::router(store, "acme/web")).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let search: Value = client
        .post(format!("{}/tools/search", base))
        .json(&json!({ "query": "session refresh", "top_k": 5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let results = search["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 5);

    let ctx = client
        .post(format!("{}/tools/file_context", base))
        .json(&json!({ "path": "src/auth/session.rs" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ctx.status(), 200);
    let ctx: Value = ctx.json().await.unwrap();
    assert_eq!(ctx["file"]["platform_id"], "src/auth/session.rs");

    let decisions: Value = client
        .post(format!("{}/tools/decision_history", base))
        .json(&json!({ "target": "src/auth/session.rs" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(decisions["decisions"].as_array().unwrap().len(), 1);

    let missing = client
        .post(format!("{}/tools/file_context", base))
        .json(&json!({ "path": "nowhere.rs" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let empty = client
        .post(format!("{}/tools/search", base))
        .json(&json!({ "query": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);

    let other_project: Value = client
        .post(format!("{}/tools/search", base))
        .json(&json!({ "project": "beta/web", "query": "session" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(other_project["results"].as_array().unwrap().is_empty());

    runtime.store.pool().close().await;
}

// ─── CLI ────────────────────────────────────────────────────────────

// The binary is driven with blocking `Command`s; the mock API needs a
// second worker thread to keep answering.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cli_init_sources_and_sync() {
    let tmp = TempDir::new().unwrap();
    let base = github_mock().await;
    let config_path = write_config(tmp.path(), &base);

    let (stdout, stderr, ok) = run_ksync(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/ksync.sqlite").exists());

    // Idempotent.
    let (_, _, ok) = run_ksync(&config_path, &["init"]);
    assert!(ok);

    let (stdout, _, ok) = run_ksync(&config_path, &["sources"]);
    assert!(ok);
    assert!(stdout.contains("github"));
    assert!(stdout.contains("slack"));
    assert!(stdout.contains("discord"));

    let (stdout, stderr, ok) = run_ksync(&config_path, &["sync", "github", "--tenant", "acme"]);
    assert!(ok, "sync failed: {}", stderr);
    assert!(stdout.contains("sync acme/github"));
    assert!(stdout.contains("fetched: 2 events"));
    assert!(stdout.contains("ok"));

    let (stdout, _, ok) = run_ksync(&config_path, &["decisions", "#7"]);
    assert!(ok);
    assert!(stdout.contains("acme/web/pull/12"));

    let (stdout, _, ok) = run_ksync(
        &config_path,
        &["history", "github", "decision", "acme/web/pull/12"],
    );
    assert!(ok);
    assert!(stdout.contains("--- Revisions (1) ---"));

    let (_, stderr, ok) = run_ksync(&config_path, &["sync", "gitlab"]);
    assert!(!ok);
    assert!(stderr.contains("not running"));

    let (_, _, ok) = run_ksync(&config_path, &["history", "github", "widget", "x"]);
    assert!(!ok);
}
