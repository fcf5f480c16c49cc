//! Fuzzy identifier lookup over the flattened id cache.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::models::{DocType, IdCacheEntry};

/// Minimum similarity for a suggestion to be returned.
pub const DEFAULT_THRESHOLD: f64 = 0.6;
/// Similarity assigned when the query is a substring of the candidate id.
pub const SUBSTRING_SCORE: f64 = 0.8;

static ID_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Whether `id` is shaped like a framework id (`AID-H-001`, `AID-H-001.002`,
/// `AID-H-001.002.S3`). Says nothing about whether the id exists.
pub fn is_well_formed_id(id: &str) -> bool {
    ID_PATTERN
        .get_or_init(|| {
            Regex::new(r"^AID-[MHDICER]-\d{3}(\.\d{3})*(\.S\d+)?$").expect("id regex must compile")
        })
        .is_match(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchReason {
    Substring,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdSuggestion {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub tactic: String,
    pub similarity_score: f64,
    pub match_reason: MatchReason,
}

/// Levenshtein edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity in `[0.0, 1.0]`: `1 - distance / max_len`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Rank cache entries by id similarity to `query`, case-insensitively.
///
/// Entries scoring below `threshold` are dropped; at most `k` are returned,
/// best first, ties broken by id.
pub fn suggest_ids(
    query: &str,
    cache: &[IdCacheEntry],
    threshold: f64,
    k: usize,
) -> Vec<IdSuggestion> {
    let query = query.trim().to_uppercase();
    if query.is_empty() {
        return Vec::new();
    }

    let mut out: Vec<IdSuggestion> = cache
        .iter()
        .filter_map(|entry| {
            let candidate = entry.source_id.to_uppercase();
            let mut score = similarity(&query, &candidate);
            let reason = if candidate.contains(&query) {
                score = score.max(SUBSTRING_SCORE);
                MatchReason::Substring
            } else {
                MatchReason::Fuzzy
            };
            (score >= threshold).then(|| IdSuggestion {
                id: entry.source_id.clone(),
                name: entry.name.clone(),
                doc_type: entry.doc_type,
                tactic: entry.tactic.clone(),
                similarity_score: (score * 100.0).round() / 100.0,
                match_reason: reason,
            })
        })
        .collect();

    out.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    out.truncate(k);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> IdCacheEntry {
        IdCacheEntry {
            source_id: id.to_string(),
            name: format!("{} name", id),
            doc_type: DocType::Technique,
            tactic: "Harden".into(),
        }
    }

    #[test]
    fn test_well_formed_ids() {
        assert!(is_well_formed_id("AID-H-001"));
        assert!(is_well_formed_id("AID-H-001.002"));
        assert!(is_well_formed_id("AID-R-010.001.S12"));
        assert!(!is_well_formed_id("AID-X-001"));
        assert!(!is_well_formed_id("AID-H-01"));
        assert!(!is_well_formed_id("aid-h-001"));
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_suggests_near_misses_first() {
        let cache = vec![entry("AID-H-001"), entry("AID-H-002"), entry("AID-E-210.005.S4")];
        let hits = suggest_ids("aid-h-00l", &cache, DEFAULT_THRESHOLD, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "AID-H-001");
        assert_eq!(hits[0].match_reason, MatchReason::Fuzzy);
        assert!(hits.iter().all(|h| h.similarity_score >= DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_substring_match_is_boosted() {
        let cache = vec![entry("AID-H-001.002.S1")];
        let hits = suggest_ids("H-001", &cache, DEFAULT_THRESHOLD, 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity_score, SUBSTRING_SCORE);
        assert_eq!(hits[0].match_reason, MatchReason::Substring);
    }

    #[test]
    fn test_limit_and_empty_query() {
        let cache: Vec<_> = (1..=9).map(|n| entry(&format!("AID-H-00{}", n))).collect();
        assert_eq!(suggest_ids("AID-H-00", &cache, DEFAULT_THRESHOLD, 5).len(), 5);
        assert!(suggest_ids("  ", &cache, DEFAULT_THRESHOLD, 5).is_empty());
    }
}
