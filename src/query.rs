//! CLI read commands: `search`, `file`, `decisions`, `history`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::store::sqlite::SqliteStore;
use crate::store::{Direction, EntityKind, EntityRecord, KnowledgeStore, NaturalKey};

/// `--project`, falling back to the first tenant's project.
fn resolve_project(config: &Config, project: Option<String>) -> String {
    project
        .or_else(|| config.tenants.first().map(|t| t.project.clone()))
        .unwrap_or_else(|| "default".to_string())
}

async fn open(config: &Config) -> Result<SqliteStore> {
    Ok(SqliteStore::new(db::connect(config).await?))
}

fn date(record: &EntityRecord) -> String {
    record.recency().format("%Y-%m-%d").to_string()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat.to_string(),
    }
}

pub async fn run_search(
    config: &Config,
    query: &str,
    project: Option<String>,
    limit: usize,
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let project = resolve_project(config, project);
    let store = open(config).await?;
    let hits = store.search_by_query(&project, query, limit).await?;

    if hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in hits.iter().enumerate() {
        let e = &hit.entity;
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.score,
            e.kind,
            e.title.as_deref().unwrap_or(&e.platform_id)
        );
        println!("    date: {}", date(e));
        println!("    key: {}", e.key());
        if !e.content.is_empty() {
            println!("    excerpt: \"{}\"", excerpt(&e.content, 160));
        }
        println!();
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_file_context(
    config: &Config,
    path: &str,
    project: Option<String>,
    limit: usize,
) -> Result<()> {
    let project = resolve_project(config, project);
    let store = open(config).await?;
    let Some(ctx) = store.get_context_for_file(&project, path, limit).await? else {
        store.pool().close().await;
        bail!("No file matching '{}' in project {}", path, project);
    };

    println!("--- File ---");
    println!("path:    {}", ctx.file.platform_id);
    println!("project: {}", ctx.file.project);
    println!();
    println!("--- Related ({}) ---", ctx.related.len());
    for rel in &ctx.related {
        let arrow = match rel.direction {
            Direction::Outgoing => "->",
            Direction::Incoming => "<-",
        };
        println!(
            "{} {} {} [{}] {}",
            date(&rel.entity),
            arrow,
            rel.relationship,
            rel.entity.kind,
            rel.entity.title.as_deref().unwrap_or(&rel.entity.platform_id)
        );
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_decisions(config: &Config, target: &str, project: Option<String>) -> Result<()> {
    let project = resolve_project(config, project);
    let store = open(config).await?;
    let decisions = store.get_decision_history(&project, target).await?;

    if decisions.is_empty() {
        println!("No decisions recorded for '{}'.", target);
    }
    for d in &decisions {
        println!(
            "{}  {}  {}",
            date(d),
            d.key(),
            d.title.as_deref().unwrap_or("(untitled)")
        );
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_history(
    config: &Config,
    platform: &str,
    kind: &str,
    platform_id: &str,
    project: Option<String>,
) -> Result<()> {
    let kind: EntityKind = kind.parse()?;
    let project = resolve_project(config, project);
    let key = NaturalKey::new(platform, platform_id, kind);
    let store = open(config).await?;
    let Some(history) = store.get_entity_history(&project, &key).await? else {
        store.pool().close().await;
        bail!("No entity {} in project {}", key, project);
    };

    let e = &history.entity;
    println!("--- Entity ---");
    println!("id:         {}", e.id);
    println!("key:        {}", e.key());
    println!("title:      {}", e.title.as_deref().unwrap_or("(untitled)"));
    println!("created_at: {}", e.created_at.to_rfc3339());
    println!("updated_at: {}", e.updated_at.to_rfc3339());
    println!("metadata:   {}", e.metadata);
    println!();
    println!("--- Revisions ({}) ---", history.revisions.len());
    for rev in &history.revisions {
        println!(
            "{}  {}  {}",
            rev.recorded_at.to_rfc3339(),
            &rev.content_hash[..rev.content_hash.len().min(12)],
            rev.title.as_deref().unwrap_or("(untitled)")
        );
    }

    store.pool().close().await;
    Ok(())
}
