//! In-memory [`KnowledgeStore`] and [`CheckpointStore`] for tests and
//! embedding.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Semantics match the SQLite
//! store, including referential integrity and monotonic checkpoints.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    path_matches, rank, validate_entity, CheckpointStore, Direction, EntityHistory, EntityKind,
    EntityRecord, EntityRevision, FileContext, KnowledgeEntity, KnowledgeRelationship,
    KnowledgeStore, NaturalKey, RelatedEntity, RelationshipKind, SearchHit, StoreError,
};
use crate::search::{Ranker, TermRanker};

type ScopedKey = (String, NaturalKey);

#[derive(Default)]
struct Graph {
    entities: HashMap<ScopedKey, EntityRecord>,
    revisions: HashMap<String, Vec<EntityRevision>>,
    /// (project, source id, target id, kind)
    edges: BTreeSet<(String, String, String, RelationshipKind)>,
}

pub struct InMemoryStore {
    graph: RwLock<Graph>,
    checkpoints: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    ranker: Box<dyn Ranker>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_ranker(Box::new(TermRanker))
    }

    pub fn with_ranker(ranker: Box<dyn Ranker>) -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            checkpoints: RwLock::new(HashMap::new()),
            ranker,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Graph> {
        self.graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Graph> {
        self.graph.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    fn by_id(&self, id: &str) -> Option<&EntityRecord> {
        self.entities.values().find(|e| e.id == id)
    }

    fn neighbours(&self, project: &str, id: &str) -> Vec<RelatedEntity> {
        self.edges
            .iter()
            .filter(|(p, _, _, _)| p == project)
            .filter_map(|(_, source, target, kind)| {
                let (other, direction) = if source == id {
                    (target, Direction::Outgoing)
                } else if target == id {
                    (source, Direction::Incoming)
                } else {
                    return None;
                };
                self.by_id(other).map(|entity| RelatedEntity {
                    entity: entity.clone(),
                    relationship: *kind,
                    direction,
                })
            })
            .collect()
    }

    fn find_file(&self, project: &str, path: &str) -> Option<&EntityRecord> {
        let exact = (project.to_string(), NaturalKey::file(path));
        if let Some(file) = self.entities.get(&exact) {
            return Some(file);
        }
        self.entities
            .iter()
            .filter(|((p, key), _)| {
                p == project && key.kind == EntityKind::File && path_matches(&key.platform_id, path)
            })
            .map(|(_, e)| e)
            .min_by(|a, b| {
                a.platform_id
                    .len()
                    .cmp(&b.platform_id.len())
                    .then_with(|| a.platform_id.cmp(&b.platform_id))
            })
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn upsert_entity(
        &self,
        project: &str,
        entity: &KnowledgeEntity,
    ) -> Result<EntityRecord, StoreError> {
        validate_entity(entity)?;
        let now = Utc::now();
        let hash = entity.content_hash();
        let mut graph = self.write();
        let scoped = (project.to_string(), entity.key.clone());

        let record = match graph.entities.get(&scoped) {
            Some(existing) => EntityRecord {
                title: entity.title.clone(),
                content: entity.content.clone(),
                metadata: entity.metadata.clone(),
                content_hash: hash.clone(),
                occurred_at: entity.occurred_at.or(existing.occurred_at),
                updated_at: now,
                ..existing.clone()
            },
            None => EntityRecord {
                id: Uuid::new_v4().to_string(),
                project: project.to_string(),
                kind: entity.key.kind,
                platform: entity.key.platform.clone(),
                platform_id: entity.key.platform_id.clone(),
                title: entity.title.clone(),
                content: entity.content.clone(),
                metadata: entity.metadata.clone(),
                content_hash: hash.clone(),
                occurred_at: entity.occurred_at,
                created_at: now,
                updated_at: now,
            },
        };

        let revisions = graph.revisions.entry(record.id.clone()).or_default();
        if revisions.last().map(|r| r.content_hash.as_str()) != Some(hash.as_str()) {
            revisions.push(EntityRevision {
                content_hash: hash,
                title: record.title.clone(),
                content: record.content.clone(),
                recorded_at: now,
            });
        }

        graph.entities.insert(scoped, record.clone());
        Ok(record)
    }

    async fn upsert_relationship(
        &self,
        project: &str,
        relationship: &KnowledgeRelationship,
    ) -> Result<(), StoreError> {
        let mut graph = self.write();
        let lookup = |key: &NaturalKey| {
            graph
                .entities
                .get(&(project.to_string(), key.clone()))
                .map(|e| e.id.clone())
                .ok_or_else(|| StoreError::DanglingRelationship {
                    kind: relationship.kind,
                    missing: key.clone(),
                })
        };
        let source = lookup(&relationship.source)?;
        let target = lookup(&relationship.target)?;
        graph
            .edges
            .insert((project.to_string(), source, target, relationship.kind));
        Ok(())
    }

    async fn search_by_query(
        &self,
        project: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let candidates: Vec<EntityRecord> = self
            .read()
            .entities
            .iter()
            .filter(|((p, _), _)| p == project)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(rank(self.ranker.as_ref(), query, candidates, top_k))
    }

    async fn get_entity_history(
        &self,
        project: &str,
        key: &NaturalKey,
    ) -> Result<Option<EntityHistory>, StoreError> {
        let graph = self.read();
        Ok(graph
            .entities
            .get(&(project.to_string(), key.clone()))
            .map(|entity| EntityHistory {
                revisions: graph.revisions.get(&entity.id).cloned().unwrap_or_default(),
                entity: entity.clone(),
            }))
    }

    async fn get_context_for_file(
        &self,
        project: &str,
        path: &str,
        limit: usize,
    ) -> Result<Option<FileContext>, StoreError> {
        let graph = self.read();
        let Some(file) = graph.find_file(project, path) else {
            return Ok(None);
        };
        let mut related = graph.neighbours(project, &file.id);
        related.sort_by(|a, b| {
            b.entity
                .recency()
                .cmp(&a.entity.recency())
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        related.truncate(limit);
        Ok(Some(FileContext {
            file: file.clone(),
            related,
        }))
    }

    async fn get_decision_history(
        &self,
        project: &str,
        target: &str,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let graph = self.read();
        let anchor = graph
            .find_file(project, target)
            .or_else(|| {
                graph
                    .entities
                    .get(&(project.to_string(), NaturalKey::feature(target)))
            })
            .map(|e| e.id.clone());
        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };

        let mut decisions: Vec<EntityRecord> = graph
            .neighbours(project, &anchor)
            .into_iter()
            .map(|r| r.entity)
            .filter(|e| e.kind == EntityKind::Decision)
            .collect();
        decisions.sort_by(|a, b| a.recency().cmp(&b.recency()).then_with(|| a.id.cmp(&b.id)));
        decisions.dedup_by(|a, b| a.id == b.id);
        Ok(decisions)
    }

    async fn entity_count(&self, project: &str) -> Result<u64, StoreError> {
        Ok(self
            .read()
            .entities
            .keys()
            .filter(|(p, _)| p == project)
            .count() as u64)
    }

    async fn relationship_count(&self, project: &str) -> Result<u64, StoreError> {
        Ok(self
            .read()
            .edges
            .iter()
            .filter(|(p, _, _, _)| p == project)
            .count() as u64)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn get_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tenant.to_string(), connector.to_string()))
            .copied())
    }

    async fn advance_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = checkpoints
            .entry((tenant.to_string(), connector.to_string()))
            .or_insert(at);
        if at > *slot {
            *slot = at;
        }
        Ok(*slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decision(id: &str, title: &str) -> KnowledgeEntity {
        KnowledgeEntity::new(NaturalKey::new("github", id, EntityKind::Decision))
            .with_title(title)
            .with_content(format!("{} body", title))
    }

    #[tokio::test]
    async fn test_upsert_same_key_updates_in_place() {
        let store = InMemoryStore::new();
        let first = store.upsert_entity("p", &decision("pr/1", "Adopt sqlx")).await.unwrap();
        let second = store
            .upsert_entity("p", &decision("pr/1", "Adopt sqlx everywhere"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title.as_deref(), Some("Adopt sqlx everywhere"));
        assert_eq!(store.entity_count("p").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_only_records_changed_content() {
        let store = InMemoryStore::new();
        let key = NaturalKey::new("github", "pr/1", EntityKind::Decision);
        store.upsert_entity("p", &decision("pr/1", "v1")).await.unwrap();
        store.upsert_entity("p", &decision("pr/1", "v1")).await.unwrap();
        store.upsert_entity("p", &decision("pr/1", "v2")).await.unwrap();

        let history = store.get_entity_history("p", &key).await.unwrap().unwrap();
        let titles: Vec<_> = history.revisions.iter().map(|r| r.title.clone().unwrap()).collect();
        assert_eq!(titles, vec!["v1", "v2"]);
        assert!(store.get_entity_history("other", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_relationship_rejected() {
        let store = InMemoryStore::new();
        store.upsert_entity("p", &decision("pr/1", "x")).await.unwrap();
        let rel = KnowledgeRelationship::new(
            NaturalKey::file("src/lib.rs"),
            RelationshipKind::ModifiedBy,
            NaturalKey::new("github", "pr/1", EntityKind::Decision),
        );
        let err = store.upsert_relationship("p", &rel).await.unwrap_err();
        assert!(matches!(err, StoreError::DanglingRelationship { .. }));
        assert_eq!(store.relationship_count("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_is_project_scoped() {
        let store = InMemoryStore::new();
        store.upsert_entity("a", &decision("pr/1", "Session refresh")).await.unwrap();
        store.upsert_entity("b", &decision("pr/2", "Session refresh")).await.unwrap();

        let hits = store.search_by_query("a", "session", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.project, "a");
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = InMemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(store.get_checkpoint("t", "github").await.unwrap(), None);
        store.advance_checkpoint("t", "github", t2).await.unwrap();
        let stored = store.advance_checkpoint("t", "github", t1).await.unwrap();
        assert_eq!(stored, t2);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_of_one_key_share_an_entity() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..40 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .upsert_entity("p", &decision("pr/1", &format!("rev {}", i)))
                    .await
            });
        }
        let mut ids = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            ids.insert(joined.unwrap().unwrap().id);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.entity_count("p").await.unwrap(), 1);
        let key = NaturalKey::new("github", "pr/1", EntityKind::Decision);
        let history = store.get_entity_history("p", &key).await.unwrap().unwrap();
        assert_eq!(history.revisions.len(), 40);
    }

    #[tokio::test]
    async fn test_repeated_relationship_is_stored_once() {
        let store = InMemoryStore::new();
        store.upsert_entity("p", &decision("pr/1", "x")).await.unwrap();
        store
            .upsert_entity("p", &KnowledgeEntity::new(NaturalKey::file("src/lib.rs")))
            .await
            .unwrap();
        let rel = KnowledgeRelationship::new(
            NaturalKey::file("src/lib.rs"),
            RelationshipKind::ModifiedBy,
            NaturalKey::new("github", "pr/1", EntityKind::Decision),
        );
        store.upsert_relationship("p", &rel).await.unwrap();
        store.upsert_relationship("p", &rel).await.unwrap();
        let reverse = KnowledgeRelationship::new(
            NaturalKey::file("src/lib.rs"),
            RelationshipKind::DiscussedIn,
            NaturalKey::new("github", "pr/1", EntityKind::Decision),
        );
        store.upsert_relationship("p", &reverse).await.unwrap();
        assert_eq!(store.relationship_count("p").await.unwrap(), 2);
    }
}
