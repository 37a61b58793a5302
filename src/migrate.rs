use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Entities, one row per (project, natural key)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            kind TEXT NOT NULL,
            platform TEXT NOT NULL,
            platform_id TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            occurred_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project, platform, platform_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_project_kind ON entities(project, kind)")
        .execute(pool)
        .await?;

    // Content revisions, appended when the content hash changes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_revisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entity_revisions_entity ON entity_revisions(entity_id, id)",
    )
    .execute(pool)
    .await?;

    // Typed, directed edges
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project, source_id, target_id, kind),
            FOREIGN KEY (source_id) REFERENCES entities(id),
            FOREIGN KEY (target_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(project, target_id)",
    )
    .execute(pool)
    .await?;

    // Sync checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            tenant TEXT NOT NULL,
            connector TEXT NOT NULL,
            last_sync INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tenant, connector)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
