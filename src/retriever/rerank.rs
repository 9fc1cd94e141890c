//! Hybrid re-ranking of vector-search candidates.
//!
//! Each candidate gets a composite score
//! `0.6 * vector similarity + 0.3 * keyword score + 0.1 * metadata boost`,
//! where the keyword score is the share of query entities found in the
//! passage and the boost rewards passages from a note section the question
//! asks about. Candidates are then sorted (stable, so equal scores keep
//! insertion order), capped per document, cut by a threshold that adapts to
//! the best score, and truncated to `top_k`.
use std::collections::HashMap;

use tracing::debug;

use crate::index::Passage;
use crate::indexer::Section;

const VECTOR_WEIGHT: f64 = 0.6;
const KEYWORD_WEIGHT: f64 = 0.3;
const METADATA_WEIGHT: f64 = 0.1;

/// Most candidates pulled from the index for one query.
pub const MAX_CANDIDATES: usize = 20;
/// Most passages kept from one document.
pub const MAX_PER_DOCUMENT: usize = 2;
/// Passages kept even when none clear the threshold.
pub const MIN_RESULTS: usize = 2;

const COUNSELING_KEYWORDS: &[&str] = &[
    "anxiety",
    "depression",
    "stress",
    "therapy",
    "session",
    "progress",
    "goals",
    "challenge",
    "struggle",
    "improvement",
    "breakthrough",
    "relationship",
    "family",
    "work",
    "career",
    "emotional",
    "feelings",
    "coping",
    "strategies",
    "techniques",
    "homework",
    "assignment",
];

const QUERY_STOP_WORDS: &[&str] = &[
    "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "was", "were",
    "is", "are", "what", "when", "where", "how", "why", "did", "does", "will", "would", "could",
    "should",
];

/// How many candidates to fetch for a `top_k` query.
#[must_use]
pub fn candidate_count(top_k: usize) -> usize {
    top_k.saturating_mul(3).min(MAX_CANDIDATES).max(top_k)
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

fn is_capitalized(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && word.len() > 1
        && chars.all(|c| c.is_ascii_lowercase())
}

/// Terms a passage should contain to be on topic: quoted phrases,
/// capitalized words, counseling keywords and longer non-stop words.
#[must_use]
pub fn query_entities(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut entities: Vec<String> = Vec::new();

    entities.extend(
        query
            .split('"')
            .skip(1)
            .step_by(2)
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string),
    );
    entities.extend(words(query).filter(|w| is_capitalized(w)).map(str::to_string));
    entities.extend(
        COUNSELING_KEYWORDS
            .iter()
            .filter(|k| lower.contains(**k))
            .map(|k| (*k).to_string()),
    );
    entities.extend(
        words(&lower)
            .filter(|w| w.chars().count() >= 4 && !QUERY_STOP_WORDS.contains(w))
            .map(str::to_string),
    );

    let mut unique = Vec::with_capacity(entities.len());
    for entity in entities {
        if !unique.contains(&entity) {
            unique.push(entity);
        }
    }
    unique
}

/// Note sections the question points at, e.g. "homework" asks for the plan.
fn requested_sections(query_lower: &str) -> Vec<Section> {
    [
        Section::Subjective,
        Section::Objective,
        Section::Assessment,
        Section::Plan,
    ]
    .into_iter()
    .filter(|s| {
        words(query_lower).any(|w| w == s.as_str())
            || s.indicators().iter().any(|k| query_lower.contains(k))
    })
    .collect()
}

fn keyword_score(text: &str, entities: &[String]) -> f64 {
    let lower = text.to_lowercase();
    let matches = entities
        .iter()
        .filter(|e| lower.contains(&e.to_lowercase()))
        .count();
    (matches as f64 / entities.len().max(1) as f64).min(1.0)
}

/// Score, order and filter `candidates` (in index order) for `query`.
///
/// Returned passages carry their composite score. A non-empty candidate
/// list with `top_k >= 1` always yields at least one passage.
#[must_use]
pub fn rerank(candidates: Vec<Passage>, query: &str, top_k: usize) -> Vec<Passage> {
    if candidates.is_empty() || top_k == 0 {
        return Vec::new();
    }

    let entities = query_entities(query);
    let sections = requested_sections(&query.to_lowercase());
    debug!("Query entities: {entities:?}, sections: {sections:?}");

    let mut scored: Vec<Passage> = candidates
        .into_iter()
        .map(|mut p| {
            let boost = if sections.contains(&p.section) { 1.0 } else { 0.0 };
            p.score = VECTOR_WEIGHT * p.score
                + KEYWORD_WEIGHT * keyword_score(&p.text, &entities)
                + METADATA_WEIGHT * boost;
            p
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));

    let diverse = diversify(scored);
    let mut kept = apply_threshold(diverse);
    kept.truncate(top_k);
    kept
}

/// Keep at most [`MAX_PER_DOCUMENT`] passages per document.
fn diversify(passages: Vec<Passage>) -> Vec<Passage> {
    let mut per_document: HashMap<String, usize> = HashMap::new();
    passages
        .into_iter()
        .filter(|p| {
            let seen = per_document.entry(p.filename.clone()).or_default();
            *seen += 1;
            *seen <= MAX_PER_DOCUMENT
        })
        .collect()
}

/// Drop passages well below the best one; stricter when the best is good.
fn apply_threshold(passages: Vec<Passage>) -> Vec<Passage> {
    if passages.is_empty() {
        return passages;
    }
    let max = passages
        .iter()
        .map(|p| p.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let mean = passages.iter().map(|p| p.score).sum::<f64>() / passages.len() as f64;

    let threshold = if max > 0.8 {
        mean.max(0.6)
    } else if max > 0.6 {
        (mean * 0.8).max(0.4)
    } else {
        (mean * 0.6).max(0.3)
    };

    let floor = MIN_RESULTS.min(passages.len());
    let passing = passages.iter().filter(|p| p.score >= threshold).count();
    if passing < floor {
        return passages.into_iter().take(floor).collect();
    }
    passages
        .into_iter()
        .filter(|p| p.score >= threshold)
        .collect()
}
