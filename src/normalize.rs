//! Platform-agnostic normalization helpers.
//!
//! [`normalize_event`] is the pure mapping from a [`PlatformEvent`] to a
//! [`NormalizedEvent`]. Connectors call it from `normalize_data` and only
//! layer platform quirks on top.
//!
//! Metadata keys read here:
//!
//! | Key | Type | Effect |
//! |-----|------|--------|
//! | `thread_id` | string | Thread the event belongs to |
//! | `parent_id` | string | Platform id of the event replied to |
//! | `labels` | string[] | Copied to `labels` |
//! | `state` | string | Copied to `state` |
//! | `files` | string[] | Added to `file_references` |
//! | `features` | string[] | Added to `feature_references` |

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::models::{NormalizedEvent, PlatformEvent};

/// Extensions recognised as source or documentation files in free text.
const FILE_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "js", "jsx", "ts", "tsx", "java", "kt", "swift", "c", "h", "cc", "cpp",
    "hpp", "cs", "rb", "php", "scala", "sql", "sh", "yaml", "yml", "toml", "json", "md", "proto",
    "tf", "css", "scss", "html", "vue", "lock",
];

/// Characters stripped from the start of a candidate token.
const LEADING_PUNCTUATION: &[char] = &['(', '[', '{', '<', '`', '\'', '"', '*'];

/// Characters stripped from the end of a candidate token.
const TRAILING_PUNCTUATION: &[char] = &[
    ')', ']', '}', '>', '`', '\'', '"', ',', ':', ';', '!', '?', '.', '*',
];

/// Map one raw event to the canonical shape.
///
/// A reply (metadata `parent_id` set) always gets a `thread_id`: the
/// declared one if present, otherwise the parent's id.
pub fn normalize_event(event: &PlatformEvent) -> NormalizedEvent {
    let parent_id = event.meta_str("parent_id").map(str::to_string);
    let thread_id = event
        .meta_str("thread_id")
        .map(str::to_string)
        .or_else(|| parent_id.clone());

    let text = match &event.title {
        Some(title) => format!("{}\n{}", title, event.content),
        None => event.content.clone(),
    };

    let mut files = Vec::new();
    merge_unique(&mut files, event.references.iter().cloned());
    merge_unique(&mut files, event.meta_strings("files"));
    merge_unique(&mut files, extract_file_references(&text));

    let mut features = Vec::new();
    merge_unique(&mut features, event.meta_strings("features"));
    merge_unique(&mut features, extract_feature_references(&text));

    NormalizedEvent {
        platform_id: event.id.clone(),
        event_type: event.event_type,
        timestamp: event.timestamp,
        author: event.author.clone(),
        content: event.content.clone(),
        title: event.title.clone(),
        thread_id,
        parent_id,
        file_references: files,
        feature_references: features,
        labels: event.meta_strings("labels"),
        state: event.meta_str("state").map(str::to_string),
        platform: event.platform.clone(),
    }
}

pub fn normalize_all(events: &[PlatformEvent]) -> Vec<NormalizedEvent> {
    events.iter().map(normalize_event).collect()
}

/// Find file paths mentioned in free text by token and extension matching.
///
/// URLs are skipped; results are deduplicated in first-seen order.
pub fn extract_file_references(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let candidates = text
        .split_whitespace()
        .map(|tok| {
            tok.trim_start_matches(LEADING_PUNCTUATION)
                .trim_end_matches(TRAILING_PUNCTUATION)
        })
        .filter(|tok| looks_like_file(tok))
        .map(|tok| tok.trim_start_matches("./").to_string());
    merge_unique(&mut out, candidates);
    out
}

fn looks_like_file(token: &str) -> bool {
    if token.is_empty() || token.contains("://") || token.starts_with('@') {
        return false;
    }
    let Some((stem, ext)) = token.rsplit_once('.') else {
        return false;
    };
    if stem.is_empty() || stem.ends_with('/') {
        return false;
    }
    if !stem
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        return false;
    }
    FILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

fn feature_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^\w&/])(#\d+)\b|\b(feature/[A-Za-z0-9._-]+)").expect("valid regex")
    })
}

/// Find feature references: `#123` issue numbers and `feature/<name>` branches.
pub fn extract_feature_references(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let found = feature_pattern().captures_iter(text).filter_map(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim_end_matches('.').to_string())
    });
    merge_unique(&mut out, found);
    out
}

/// Append items not already present, preserving order.
pub fn merge_unique(target: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    let mut seen: HashSet<String> = target.iter().cloned().collect();
    for item in items {
        if seen.insert(item.clone()) {
            target.push(item);
        }
    }
}
