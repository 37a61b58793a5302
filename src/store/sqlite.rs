//! SQLite-backed [`KnowledgeStore`] and [`CheckpointStore`].
//!
//! Deduplication is enforced by the schema: `entities` carries
//! `UNIQUE(project, platform, platform_id, kind)` and every upsert is an
//! `INSERT ... ON CONFLICT DO UPDATE`, so concurrent writers to the same
//! natural key converge on one row. Timestamps are stored as Unix
//! milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{
    path_matches, rank, validate_entity, CheckpointStore, Direction, EntityHistory, EntityKind,
    EntityRecord, EntityRevision, FileContext, KnowledgeEntity, KnowledgeRelationship,
    KnowledgeStore, NaturalKey, RelatedEntity, SearchHit, StoreError,
};
use crate::search::{Ranker, TermRanker};

/// Unqualified entity columns, for `RETURNING`.
const ENTITY_FIELDS: &str = "id, project, kind, platform, platform_id, title, content, \
     metadata_json, content_hash, occurred_at, created_at, updated_at";

/// Entity columns qualified with the `e` alias.
const ENTITY_COLUMNS: &str = "e.id, e.project, e.kind, e.platform, e.platform_id, e.title, \
     e.content, e.metadata_json, e.content_hash, e.occurred_at, e.created_at, e.updated_at";

pub struct SqliteStore {
    pool: SqlitePool,
    ranker: Box<dyn Ranker>,
}

impl SqliteStore {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_ranker(pool, Box::new(TermRanker))
    }

    pub fn with_ranker(pool: SqlitePool, ranker: Box<dyn Ranker>) -> Self {
        Self { pool, ranker }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn entity_by_key(
        &self,
        project: &str,
        key: &NaturalKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM entities e \
             WHERE e.project = ? AND e.platform = ? AND e.platform_id = ? AND e.kind = ?",
            ENTITY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(project)
            .bind(&key.platform)
            .bind(&key.platform_id)
            .bind(key.kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    /// Exact file key, else the shortest path ending in `/<path>`.
    async fn find_file(&self, project: &str, path: &str) -> Result<Option<EntityRecord>, StoreError> {
        if let Some(file) = self.entity_by_key(project, &NaturalKey::file(path)).await? {
            return Ok(Some(file));
        }
        let pattern = format!("%/{}", escape_like(path.trim_start_matches('/')));
        let sql = format!(
            "SELECT {} FROM entities e \
             WHERE e.project = ? AND e.kind = 'file' AND e.platform_id LIKE ? ESCAPE '\\' \
             ORDER BY length(e.platform_id), e.platform_id",
            ENTITY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let file = row_to_entity(row)?;
            if path_matches(&file.platform_id, path) {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    async fn neighbours(&self, project: &str, id: &str) -> Result<Vec<RelatedEntity>, StoreError> {
        let sql = format!(
            "SELECT r.kind AS rel_kind, 'outgoing' AS direction, {cols} \
             FROM relationships r JOIN entities e ON e.id = r.target_id \
             WHERE r.project = ? AND r.source_id = ? \
             UNION ALL \
             SELECT r.kind AS rel_kind, 'incoming' AS direction, {cols} \
             FROM relationships r JOIN entities e ON e.id = r.source_id \
             WHERE r.project = ? AND r.target_id = ?",
            cols = ENTITY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project)
            .bind(id)
            .bind(project)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let relationship = row.try_get::<String, _>("rel_kind")?.parse()?;
                let direction = match row.try_get::<String, _>("direction")?.as_str() {
                    "outgoing" => Direction::Outgoing,
                    _ => Direction::Incoming,
                };
                Ok(RelatedEntity {
                    entity: row_to_entity(row)?,
                    relationship,
                    direction,
                })
            })
            .collect()
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidInput(format!("timestamp out of range: {}", ms)))
}

fn row_to_entity(row: &SqliteRow) -> Result<EntityRecord, StoreError> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let occurred_at: Option<i64> = row.try_get("occurred_at")?;
    Ok(EntityRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        platform: row.try_get("platform")?,
        platform_id: row.try_get("platform_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        metadata: serde_json::from_str(&metadata_json)?,
        content_hash: row.try_get("content_hash")?,
        occurred_at: occurred_at.map(from_millis).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert_entity(
        &self,
        project: &str,
        entity: &KnowledgeEntity,
    ) -> Result<EntityRecord, StoreError> {
        validate_entity(entity)?;
        let now = Utc::now().timestamp_millis();
        let hash = entity.content_hash();
        let metadata_json = serde_json::to_string(&entity.metadata)?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO entities (id, project, kind, platform, platform_id, title, content,
                                  metadata_json, content_hash, occurred_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, platform, platform_id, kind) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                metadata_json = excluded.metadata_json,
                content_hash = excluded.content_hash,
                occurred_at = COALESCE(excluded.occurred_at, entities.occurred_at),
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            ENTITY_FIELDS
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(project)
            .bind(entity.key.kind.as_str())
            .bind(&entity.key.platform)
            .bind(&entity.key.platform_id)
            .bind(&entity.title)
            .bind(&entity.content)
            .bind(&metadata_json)
            .bind(&hash)
            .bind(entity.occurred_at.map(|t| t.timestamp_millis()))
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let record = row_to_entity(&row)?;

        let last_hash: Option<String> = sqlx::query_scalar(
            "SELECT content_hash FROM entity_revisions WHERE entity_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await?;

        if last_hash.as_deref() != Some(hash.as_str()) {
            sqlx::query(
                "INSERT INTO entity_revisions (entity_id, content_hash, title, content, recorded_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&hash)
            .bind(&record.title)
            .bind(&record.content)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn upsert_relationship(
        &self,
        project: &str,
        relationship: &KnowledgeRelationship,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut ids = Vec::with_capacity(2);
        for key in [&relationship.source, &relationship.target] {
            let id: Option<String> = sqlx::query_scalar(
                "SELECT id FROM entities WHERE project = ? AND platform = ? AND platform_id = ? AND kind = ?",
            )
            .bind(project)
            .bind(&key.platform)
            .bind(&key.platform_id)
            .bind(key.kind.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            match id {
                Some(id) => ids.push(id),
                None => {
                    return Err(StoreError::DanglingRelationship {
                        kind: relationship.kind,
                        missing: key.clone(),
                    })
                }
            }
        }

        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO relationships (project, source_id, target_id, kind, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, source_id, target_id, kind) DO UPDATE SET
                updated_at = excluded.updated_at
            "#,
        )
        .bind(project)
        .bind(&ids[0])
        .bind(&ids[1])
        .bind(relationship.kind.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn search_by_query(
        &self,
        project: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let sql = format!("SELECT {} FROM entities e WHERE e.project = ?", ENTITY_COLUMNS);
        let rows = sqlx::query(&sql).bind(project).fetch_all(&self.pool).await?;
        let candidates = rows
            .iter()
            .map(row_to_entity)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rank(self.ranker.as_ref(), query, candidates, top_k))
    }

    async fn get_entity_history(
        &self,
        project: &str,
        key: &NaturalKey,
    ) -> Result<Option<EntityHistory>, StoreError> {
        let Some(entity) = self.entity_by_key(project, key).await? else {
            return Ok(None);
        };
        let rows = sqlx::query(
            "SELECT content_hash, title, content, recorded_at FROM entity_revisions \
             WHERE entity_id = ? ORDER BY id ASC",
        )
        .bind(&entity.id)
        .fetch_all(&self.pool)
        .await?;

        let revisions = rows
            .iter()
            .map(|row| {
                Ok(EntityRevision {
                    content_hash: row.try_get("content_hash")?,
                    title: row.try_get("title")?,
                    content: row.try_get("content")?,
                    recorded_at: from_millis(row.try_get("recorded_at")?)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(EntityHistory { entity, revisions }))
    }

    async fn get_context_for_file(
        &self,
        project: &str,
        path: &str,
        limit: usize,
    ) -> Result<Option<FileContext>, StoreError> {
        let Some(file) = self.find_file(project, path).await? else {
            return Ok(None);
        };
        let mut related = self.neighbours(project, &file.id).await?;
        related.sort_by(|a, b| {
            b.entity
                .recency()
                .cmp(&a.entity.recency())
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        related.truncate(limit);
        Ok(Some(FileContext { file, related }))
    }

    async fn get_decision_history(
        &self,
        project: &str,
        target: &str,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let anchor = match self.find_file(project, target).await? {
            Some(file) => Some(file),
            None => self.entity_by_key(project, &NaturalKey::feature(target)).await?,
        };
        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };

        let mut decisions: Vec<EntityRecord> = self
            .neighbours(project, &anchor.id)
            .await?
            .into_iter()
            .map(|r| r.entity)
            .filter(|e| e.kind == EntityKind::Decision)
            .collect();
        decisions.sort_by(|a, b| a.recency().cmp(&b.recency()).then_with(|| a.id.cmp(&b.id)));
        decisions.dedup_by(|a, b| a.id == b.id);
        Ok(decisions)
    }

    async fn entity_count(&self, project: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE project = ?")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn relationship_count(&self, project: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM relationships WHERE project = ?")
                .bind(project)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT last_sync FROM sync_checkpoints WHERE tenant = ? AND connector = ?",
        )
        .bind(tenant)
        .bind(connector)
        .fetch_optional(&self.pool)
        .await?;
        last.map(from_millis).transpose()
    }

    async fn advance_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let stored: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_checkpoints (tenant, connector, last_sync, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tenant, connector) DO UPDATE SET
                last_sync = MAX(sync_checkpoints.last_sync, excluded.last_sync),
                updated_at = excluded.updated_at
            RETURNING last_sync
            "#,
        )
        .bind(tenant)
        .bind(connector)
        .bind(at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        from_millis(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::store::RelationshipKind;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("ks.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn entity(kind: EntityKind, id: &str, title: &str) -> KnowledgeEntity {
        KnowledgeEntity::new(NaturalKey::new("github", id, kind))
            .with_title(title)
            .with_content(format!("{} details", title))
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_natural_key() {
        let (_tmp, store) = store().await;
        let a = store
            .upsert_entity("p", &entity(EntityKind::Decision, "pr/1", "Adopt WAL"))
            .await
            .unwrap();
        let b = store
            .upsert_entity("p", &entity(EntityKind::Decision, "pr/1", "Adopt WAL mode"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(b.title.as_deref(), Some("Adopt WAL mode"));

        // Same platform id, different kind: a separate entity.
        store
            .upsert_entity("p", &entity(EntityKind::Discussion, "pr/1", "Adopt WAL"))
            .await
            .unwrap();
        assert_eq!(store.entity_count("p").await.unwrap(), 2);

        let history = store
            .get_entity_history("p", &NaturalKey::new("github", "pr/1", EntityKind::Decision))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.revisions.len(), 2);
    }

    #[tokio::test]
    async fn test_relationship_requires_both_endpoints() {
        let (_tmp, store) = store().await;
        store
            .upsert_entity("p", &entity(EntityKind::Decision, "pr/1", "Split auth"))
            .await
            .unwrap();
        let rel = KnowledgeRelationship::new(
            NaturalKey::file("src/auth.rs"),
            RelationshipKind::ModifiedBy,
            NaturalKey::new("github", "pr/1", EntityKind::Decision),
        );
        assert!(matches!(
            store.upsert_relationship("p", &rel).await,
            Err(StoreError::DanglingRelationship { .. })
        ));
        assert_eq!(store.relationship_count("p").await.unwrap(), 0);

        store
            .upsert_entity("p", &KnowledgeEntity::new(NaturalKey::file("src/auth.rs")))
            .await
            .unwrap();
        store.upsert_relationship("p", &rel).await.unwrap();
        store.upsert_relationship("p", &rel).await.unwrap();
        assert_eq!(store.relationship_count("p").await.unwrap(), 1);

        let ctx = store
            .get_context_for_file("p", "auth.rs", 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.file.platform_id, "src/auth.rs");
        assert_eq!(ctx.related.len(), 1);
        assert_eq!(ctx.related[0].direction, Direction::Outgoing);
        assert_eq!(ctx.related[0].relationship, RelationshipKind::ModifiedBy);

        let decisions = store.get_decision_history("p", "src/auth.rs").await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].platform_id, "pr/1");
    }

    #[tokio::test]
    async fn test_like_wildcards_in_paths_are_literal() {
        let (_tmp, store) = store().await;
        store
            .upsert_entity("p", &KnowledgeEntity::new(NaturalKey::file("src/a_b.rs")))
            .await
            .unwrap();
        assert!(store.get_context_for_file("p", "axb.rs", 5).await.unwrap().is_none());
        assert!(store.get_context_for_file("p", "a_b.rs", 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let (_tmp, store) = store().await;
        let early = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let late = DateTime::from_timestamp_millis(1_700_000_500_000).unwrap();
        store.advance_checkpoint("t", "slack", late).await.unwrap();
        assert_eq!(store.advance_checkpoint("t", "slack", early).await.unwrap(), late);
        assert_eq!(store.get_checkpoint("t", "slack").await.unwrap(), Some(late));
        assert_eq!(store.get_checkpoint("t", "github").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_of_one_key_share_an_entity() {
        let (_tmp, store) = store().await;
        let store = std::sync::Arc::new(store);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..40 {
            let store = store.clone();
            let decision = entity(EntityKind::Decision, "pr/1", &format!("rev {}", i));
            tasks.spawn(async move { store.upsert_entity("p", &decision).await });
        }
        let mut ids = std::collections::BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            ids.insert(joined.unwrap().unwrap().id);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.entity_count("p").await.unwrap(), 1);
        let history = store
            .get_entity_history("p", &NaturalKey::new("github", "pr/1", EntityKind::Decision))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.revisions.len(), 40);
    }
}
