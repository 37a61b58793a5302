//! Knowledge graph storage.
//!
//! The graph holds five entity kinds connected by four typed, directed
//! relationship kinds, all scoped to a project:
//!
//! ```text
//! File ──modified_by──▶ Decision ───introduced_by──▶ Contributor
//!  │                       │                              ▲
//!  │                       └──relates_to──▶ Feature       │
//!  │                                           ▲          │
//!  └──discussed_in──▶ Discussion ──relates_to──┘          │
//!                          └─────────introduced_by────────┘
//! ```
//!
//! Entities are identified by a [`NaturalKey`] `(platform, platform_id,
//! kind)`; upserting the same key twice updates the existing entity.
//! Relationships require both endpoints to exist.
//!
//! Two backends implement [`KnowledgeStore`] and [`CheckpointStore`] with
//! identical semantics: [`sqlite::SqliteStore`] for deployments and
//! [`memory::InMemoryStore`] for tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Platform namespace shared by File and Feature entities so that every
/// platform mentioning `src/lib.rs` or `#42` links to the same node.
pub const SHARED_PLATFORM: &str = "project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Feature,
    File,
    Decision,
    Discussion,
    Contributor,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Feature,
        EntityKind::File,
        EntityKind::Decision,
        EntityKind::Discussion,
        EntityKind::Contributor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Feature => "feature",
            EntityKind::File => "file",
            EntityKind::Decision => "decision",
            EntityKind::Discussion => "discussion",
            EntityKind::Contributor => "contributor",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::InvalidInput(format!("unknown entity kind '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    RelatesTo,
    IntroducedBy,
    ModifiedBy,
    DiscussedIn,
}

impl RelationshipKind {
    pub const ALL: [RelationshipKind; 4] = [
        RelationshipKind::RelatesTo,
        RelationshipKind::IntroducedBy,
        RelationshipKind::ModifiedBy,
        RelationshipKind::DiscussedIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::RelatesTo => "relates_to",
            RelationshipKind::IntroducedBy => "introduced_by",
            RelationshipKind::ModifiedBy => "modified_by",
            RelationshipKind::DiscussedIn => "discussed_in",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        RelationshipKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::InvalidInput(format!("unknown relationship kind '{}'", s)))
    }
}

/// Deduplication key of an entity within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub platform: String,
    pub platform_id: String,
    pub kind: EntityKind,
}

impl NaturalKey {
    pub fn new(platform: impl Into<String>, platform_id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            platform: platform.into(),
            platform_id: platform_id.into(),
            kind,
        }
    }

    pub fn file(path: &str) -> Self {
        Self::new(SHARED_PLATFORM, path, EntityKind::File)
    }

    pub fn feature(name: &str) -> Self {
        Self::new(SHARED_PLATFORM, name, EntityKind::Feature)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.kind, self.platform_id)
    }
}

/// An entity as produced by the context processor, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    #[serde(flatten)]
    pub key: NaturalKey,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    /// When the underlying activity happened, if known.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl KnowledgeEntity {
    pub fn new(key: NaturalKey) -> Self {
        Self {
            key,
            title: None,
            content: String::new(),
            metadata: empty_object(),
            occurred_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn content_hash(&self) -> String {
        content_hash(self.title.as_deref(), &self.content)
    }
}

/// A directed, typed edge between two entities identified by natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRelationship {
    pub source: NaturalKey,
    pub target: NaturalKey,
    pub kind: RelationshipKind,
}

impl KnowledgeRelationship {
    pub fn new(source: NaturalKey, kind: RelationshipKind, target: NaturalKey) -> Self {
        Self { source, target, kind }
    }
}

/// A persisted entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: String,
    pub project: String,
    pub kind: EntityKind,
    pub platform: String,
    pub platform_id: String,
    pub title: Option<String>,
    pub content: String,
    pub metadata: serde_json::Value,
    pub content_hash: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(&self.platform, &self.platform_id, self.kind)
    }

    /// Text used for similarity ranking.
    pub fn searchable_text(&self) -> String {
        match &self.title {
            Some(title) => format!("{}\n{}", title, self.content),
            None => self.content.clone(),
        }
    }

    /// Sort key for "most recent first" listings.
    pub fn recency(&self) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(self.updated_at)
    }
}

/// One stored version of an entity's title and content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRevision {
    pub content_hash: String,
    pub title: Option<String>,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// An entity plus its revisions, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHistory {
    pub entity: EntityRecord,
    pub revisions: Vec<EntityRevision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub entity: EntityRecord,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The anchor entity is the edge source.
    Outgoing,
    /// The anchor entity is the edge target.
    Incoming,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedEntity {
    pub entity: EntityRecord,
    pub relationship: RelationshipKind,
    pub direction: Direction,
}

/// A file entity and its graph neighbourhood, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub file: EntityRecord,
    pub related: Vec<RelatedEntity>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relationship {kind} references missing entity {missing}")]
    DanglingRelationship {
        kind: RelationshipKind,
        missing: NaturalKey,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// SHA-256 over title and content, hex encoded.
pub fn content_hash(title: Option<&str>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn validate_entity(entity: &KnowledgeEntity) -> Result<(), StoreError> {
    if entity.key.platform.trim().is_empty() || entity.key.platform_id.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "entity key must have a platform and platform id (got {})",
            entity.key
        )));
    }
    Ok(())
}

/// Project-scoped knowledge graph operations.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_entity`](KnowledgeStore::upsert_entity) | Insert or update by natural key |
/// | [`upsert_relationship`](KnowledgeStore::upsert_relationship) | Add an edge between existing entities |
/// | [`search_by_query`](KnowledgeStore::search_by_query) | Similarity-ranked top-K |
/// | [`get_entity_history`](KnowledgeStore::get_entity_history) | Entity plus revisions |
/// | [`get_context_for_file`](KnowledgeStore::get_context_for_file) | A file's neighbourhood |
/// | [`get_decision_history`](KnowledgeStore::get_decision_history) | Decisions behind a file or feature |
///
/// Every read is scoped to one project; nothing from another project is
/// ever returned. Concurrent upserts of the same key are last-write-wins
/// and never create a second entity.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn upsert_entity(
        &self,
        project: &str,
        entity: &KnowledgeEntity,
    ) -> Result<EntityRecord, StoreError>;

    /// Fails with [`StoreError::DanglingRelationship`] and writes nothing
    /// when either endpoint does not exist in `project`.
    async fn upsert_relationship(
        &self,
        project: &str,
        relationship: &KnowledgeRelationship,
    ) -> Result<(), StoreError>;

    async fn search_by_query(
        &self,
        project: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;

    async fn get_entity_history(
        &self,
        project: &str,
        key: &NaturalKey,
    ) -> Result<Option<EntityHistory>, StoreError>;

    /// Exact path match first, then the shortest path ending in `/<path>`.
    async fn get_context_for_file(
        &self,
        project: &str,
        path: &str,
        limit: usize,
    ) -> Result<Option<FileContext>, StoreError>;

    /// Decisions linked to a file path or feature name, oldest first.
    async fn get_decision_history(
        &self,
        project: &str,
        target: &str,
    ) -> Result<Vec<EntityRecord>, StoreError>;

    async fn entity_count(&self, project: &str) -> Result<u64, StoreError>;

    async fn relationship_count(&self, project: &str) -> Result<u64, StoreError>;
}

/// Per (tenant, connector) sync checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Move the checkpoint forward to `at`. An earlier `at` leaves it
    /// unchanged. Returns the stored value.
    async fn advance_checkpoint(
        &self,
        tenant: &str,
        connector: &str,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError>;
}

/// Both store roles behind one object.
pub trait GraphStore: KnowledgeStore + CheckpointStore {}

impl<T: KnowledgeStore + CheckpointStore> GraphStore for T {}

/// Rank `candidates` against `query` and keep the best `top_k`.
///
/// Ties break on recency, then id, so results are deterministic.
pub(crate) fn rank(
    ranker: &dyn crate::search::Ranker,
    query: &str,
    candidates: Vec<EntityRecord>,
    top_k: usize,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter_map(|entity| {
            let score = ranker.score(query, &entity.searchable_text());
            (score > 0.0).then_some(SearchHit { entity, score })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entity.recency().cmp(&a.entity.recency()))
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
    hits.truncate(top_k);
    hits
}

/// Whether `candidate` is `path` or ends with `/<path>`.
pub(crate) fn path_matches(candidate: &str, path: &str) -> bool {
    candidate == path || candidate.ends_with(&format!("/{}", path.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_deserializes_with_flattened_key() {
        let entity: KnowledgeEntity = serde_json::from_value(serde_json::json!({
            "platform": "github",
            "platform_id": "acme/web/pull/1",
            "kind": "decision",
            "title": "Adopt sqlx"
        }))
        .unwrap();
        assert_eq!(entity.key.kind, EntityKind::Decision);
        assert_eq!(entity.metadata, serde_json::json!({}));
        assert_eq!(entity.content, "");
    }

    #[test]
    fn test_content_hash_separates_title_and_content() {
        assert_ne!(content_hash(Some("ab"), "c"), content_hash(Some("a"), "bc"));
        assert_eq!(content_hash(None, "x"), content_hash(Some(""), "x"));
    }

    #[test]
    fn test_path_matches_suffix_on_segment_boundary() {
        assert!(path_matches("src/auth/session.rs", "session.rs"));
        assert!(path_matches("src/auth/session.rs", "auth/session.rs"));
        assert!(!path_matches("src/auth/mysession.rs", "session.rs"));
    }
}
