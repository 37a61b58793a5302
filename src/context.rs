//! Context processing: turning normalized events into graph entities and
//! relationships.
//!
//! The orchestrator hands each normalized batch to a [`ContextProcessor`]
//! and persists what comes back. Two processors ship with the crate:
//!
//! - [`HeuristicProcessor`] is deterministic and needs nothing external.
//! - [`HttpContextProcessor`] posts the batch to an external extraction
//!   service and reads the result back as JSON.
//!
//! A processor returns one [`KnowledgeObject`] per input event so a
//! persistence failure only ever affects that event.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ContextProcessorConfig;
use crate::models::{EventType, NormalizedEvent};
use crate::store::{EntityKind, KnowledgeEntity, KnowledgeRelationship, NaturalKey, RelationshipKind};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRequest {
    pub tenant: String,
    pub project: String,
    pub events: Vec<NormalizedEvent>,
}

/// Entities and relationships extracted from one event.
///
/// Entities are persisted before relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeObject {
    pub event_id: String,
    #[serde(default)]
    pub entities: Vec<KnowledgeEntity>,
    #[serde(default)]
    pub relationships: Vec<KnowledgeRelationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBatch {
    #[serde(default)]
    pub objects: Vec<KnowledgeObject>,
}

#[async_trait]
pub trait ContextProcessor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<KnowledgeBatch>;
}

/// Build the processor named by `[context_processor].provider`.
pub fn build_processor(config: &ContextProcessorConfig) -> Result<Arc<dyn ContextProcessor>> {
    match config.provider.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicProcessor)),
        "http" => Ok(Arc::new(HttpContextProcessor::new(config)?)),
        other => bail!("Unknown context processor: '{}'", other),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Heuristic
// ═══════════════════════════════════════════════════════════════════════

/// Rule-based extraction.
///
/// | Event | Entity |
/// |-------|--------|
/// | pull request, commit, file change | Decision |
/// | issue, message, thread, reaction, discussion | Discussion |
/// | author | Contributor (per platform) |
/// | file reference | File (shared `project` namespace) |
/// | feature reference | Feature (shared `project` namespace) |
///
/// Edges: item `introduced_by` contributor, file `modified_by` decision,
/// file `discussed_in` discussion, item `relates_to` feature, and reply
/// `relates_to` parent when the parent is in the same batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicProcessor;

pub fn entity_kind_for(event_type: EventType) -> EntityKind {
    match event_type {
        EventType::PullRequest | EventType::Commit | EventType::FileChange => EntityKind::Decision,
        EventType::Issue
        | EventType::Message
        | EventType::Thread
        | EventType::Reaction
        | EventType::Discussion => EntityKind::Discussion,
    }
}

impl HeuristicProcessor {
    pub fn extract(&self, events: &[NormalizedEvent]) -> KnowledgeBatch {
        let in_batch: HashMap<&str, EntityKind> = events
            .iter()
            .map(|e| (e.platform_id.as_str(), entity_kind_for(e.event_type)))
            .collect();

        let objects = events
            .iter()
            .map(|event| self.extract_one(event, &in_batch))
            .collect();
        KnowledgeBatch { objects }
    }

    fn extract_one(
        &self,
        event: &NormalizedEvent,
        in_batch: &HashMap<&str, EntityKind>,
    ) -> KnowledgeObject {
        let kind = entity_kind_for(event.event_type);
        let item_key = NaturalKey::new(&event.platform, &event.platform_id, kind);

        let mut item = KnowledgeEntity::new(item_key.clone())
            .with_content(event.content.clone())
            .with_metadata(json!({
                "event_type": event.event_type,
                "author": event.author,
                "labels": event.labels,
                "state": event.state,
                "thread_id": event.thread_id,
                "parent_id": event.parent_id,
            }))
            .occurred_at(event.timestamp);
        item.title = event.title.clone();

        let mut entities = vec![item];
        let mut relationships = Vec::new();

        if !event.author.is_empty() {
            let contributor = NaturalKey::new(&event.platform, &event.author, EntityKind::Contributor);
            entities.push(
                KnowledgeEntity::new(contributor.clone())
                    .with_title(event.author.clone())
                    .with_metadata(json!({ "platform": event.platform })),
            );
            relationships.push(KnowledgeRelationship::new(
                item_key.clone(),
                RelationshipKind::IntroducedBy,
                contributor,
            ));
        }

        let file_edge = match kind {
            EntityKind::Decision => RelationshipKind::ModifiedBy,
            _ => RelationshipKind::DiscussedIn,
        };
        for path in &event.file_references {
            let file = NaturalKey::file(path);
            entities.push(KnowledgeEntity::new(file.clone()).with_title(path.clone()));
            relationships.push(KnowledgeRelationship::new(file, file_edge, item_key.clone()));
        }

        for name in &event.feature_references {
            let feature = NaturalKey::feature(name);
            entities.push(KnowledgeEntity::new(feature.clone()).with_title(name.clone()));
            relationships.push(KnowledgeRelationship::new(
                item_key.clone(),
                RelationshipKind::RelatesTo,
                feature,
            ));
        }

        if let Some(parent) = event.parent_id.as_deref() {
            if let Some(parent_kind) = in_batch.get(parent) {
                relationships.push(KnowledgeRelationship::new(
                    item_key,
                    RelationshipKind::RelatesTo,
                    NaturalKey::new(&event.platform, parent, *parent_kind),
                ));
            }
        }

        KnowledgeObject {
            event_id: event.platform_id.clone(),
            entities,
            relationships,
        }
    }
}

#[async_trait]
impl ContextProcessor for HeuristicProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<KnowledgeBatch> {
        Ok(self.extract(&request.events))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════

/// Delegates extraction to an external service.
///
/// `POST {endpoint}` with the [`ProcessRequest`] as JSON; the response
/// body must be a [`KnowledgeBatch`].
pub struct HttpContextProcessor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpContextProcessor {
    pub fn new(config: &ContextProcessorConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .context("context_processor.endpoint is required for the http provider")?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ContextProcessor for HttpContextProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<KnowledgeBatch> {
        let mut req = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("context processor request to {} failed", self.endpoint))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("context processor error ({}): {}", status, body);
        }

        resp.json()
            .await
            .context("context processor returned an invalid batch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: &str, event_type: EventType) -> NormalizedEvent {
        NormalizedEvent {
            platform_id: id.to_string(),
            event_type,
            timestamp: Utc::now(),
            author: "alice".to_string(),
            content: String::new(),
            title: Some("title".to_string()),
            thread_id: None,
            parent_id: None,
            file_references: vec![],
            feature_references: vec![],
            labels: vec![],
            state: None,
            platform: "github".to_string(),
        }
    }

    #[test]
    fn test_pull_request_becomes_decision_with_edges() {
        let mut pr = event("acme/web/pull/1", EventType::PullRequest);
        pr.file_references = vec!["src/lib.rs".into()];
        pr.feature_references = vec!["#7".into()];

        let batch = HeuristicProcessor.extract(&[pr]);
        let object = &batch.objects[0];
        let kinds: Vec<EntityKind> = object.entities.iter().map(|e| e.key.kind).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Decision, EntityKind::Contributor, EntityKind::File, EntityKind::Feature]
        );

        let edges: Vec<RelationshipKind> = object.relationships.iter().map(|r| r.kind).collect();
        assert_eq!(
            edges,
            vec![
                RelationshipKind::IntroducedBy,
                RelationshipKind::ModifiedBy,
                RelationshipKind::RelatesTo
            ]
        );
        let modified = &object.relationships[1];
        assert_eq!(modified.source, NaturalKey::file("src/lib.rs"));
        assert_eq!(modified.target.kind, EntityKind::Decision);
    }

    #[test]
    fn test_message_files_are_discussed_in() {
        let mut msg = event("C1:1.0", EventType::Message);
        msg.platform = "slack".into();
        msg.file_references = vec!["README.md".into()];
        let batch = HeuristicProcessor.extract(&[msg]);
        assert_eq!(batch.objects[0].entities[0].key.kind, EntityKind::Discussion);
        assert!(batch.objects[0]
            .relationships
            .iter()
            .any(|r| r.kind == RelationshipKind::DiscussedIn));
    }

    #[test]
    fn test_reply_links_to_parent_in_batch_only() {
        let parent = event("C1:1.0", EventType::Thread);
        let mut reply = event("C1:2.0", EventType::Message);
        reply.parent_id = Some("C1:1.0".into());
        let mut orphan = event("C1:3.0", EventType::Message);
        orphan.parent_id = Some("C1:0.5".into());

        let batch = HeuristicProcessor.extract(&[parent, reply, orphan]);
        let links = |i: usize| {
            batch.objects[i]
                .relationships
                .iter()
                .filter(|r| r.kind == RelationshipKind::RelatesTo)
                .count()
        };
        assert_eq!(links(1), 1);
        assert_eq!(links(2), 0);
    }

    #[test]
    fn test_anonymous_event_has_no_contributor() {
        let mut e = event("x", EventType::Commit);
        e.author = String::new();
        let object = &HeuristicProcessor.extract(&[e]).objects[0];
        assert_eq!(object.entities.len(), 1);
        assert!(object.relationships.is_empty());
    }

    #[test]
    fn test_build_processor_rejects_unknown_provider() {
        let mut cfg = ContextProcessorConfig::default();
        assert!(build_processor(&cfg).is_ok());
        cfg.provider = "magic".into();
        assert!(build_processor(&cfg).is_err());
    }
}
