//! Similarity ranking for knowledge graph search.
//!
//! Stores fetch the candidate entities of a project and delegate scoring
//! to a [`Ranker`]. The default [`TermRanker`] needs no model: it compares
//! term-frequency vectors of the query and the entity text by cosine
//! similarity. An embedding-backed ranker can be swapped in through the
//! same trait.

use std::collections::HashMap;

/// Scores how well `text` answers `query`. Zero means unrelated.
pub trait Ranker: Send + Sync {
    fn score(&self, query: &str, text: &str) -> f64;
}

/// Term-frequency cosine similarity over lower-cased alphanumeric terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermRanker;

impl Ranker for TermRanker {
    fn score(&self, query: &str, text: &str) -> f64 {
        let q = term_frequencies(query);
        if q.is_empty() {
            return 0.0;
        }
        let t = term_frequencies(text);
        cosine_similarity(&q, &t)
    }
}

/// Split into lower-cased terms. `_`, `-`, `.` and `/` stay inside a term
/// so paths and branch names match as a whole.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '#')))
        .map(|t| t.trim_matches(|c: char| matches!(c, '.' | '-' | '/')))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for term in tokenize(text) {
        *tf.entry(term).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let mag_a: f64 = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let mag_b: f64 = b.values().map(|x| x * x).sum::<f64>().sqrt();
    if mag_a < f64::EPSILON || mag_b < f64::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}
