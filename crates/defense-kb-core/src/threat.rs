//! Threat identifier normalization and the threat → document reverse index.
//!
//! Threat mappings reference three external frameworks: OWASP LLM Top 10
//! (`LLM01:2025 Prompt Injection`), MITRE ATLAS (`AML.T0051 LLM Prompt
//! Injection`), and MAESTRO (free-text items). Every reference is reduced to a
//! canonical key so lookups are insensitive to year suffixes and prefix
//! spelling.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::models::Document;

static OWASP_ID: OnceLock<Regex> = OnceLock::new();
static ATLAS_ID: OnceLock<Regex> = OnceLock::new();

fn owasp_re() -> &'static Regex {
    OWASP_ID.get_or_init(|| Regex::new(r"LLM\d{2}").expect("owasp regex must compile"))
}

fn atlas_re() -> &'static Regex {
    ATLAS_ID.get_or_init(|| {
        Regex::new(r"(?:AML\.)?(T\d{4}(?:\.\d{3})?)").expect("atlas regex must compile")
    })
}

/// Framework a threat mapping belongs to, judged from its framework label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Owasp,
    Atlas,
    Maestro,
    Other,
}

impl Framework {
    pub fn classify(label: &str) -> Self {
        let upper = label.to_uppercase();
        if upper.contains("OWASP") {
            Framework::Owasp
        } else if upper.contains("ATLAS") || upper.contains("MITRE") {
            Framework::Atlas
        } else if upper.contains("MAESTRO") {
            Framework::Maestro
        } else {
            Framework::Other
        }
    }
}

/// Normalize a user-supplied threat identifier.
///
/// ```rust
/// use defense_kb_core::threat::normalize_threat_id;
///
/// assert_eq!(normalize_threat_id("owasp-llm01:2025"), "LLM01");
/// assert_eq!(normalize_threat_id("T0015"), "AML.T0015");
/// assert_eq!(normalize_threat_id("AML.T0043"), "AML.T0043");
/// ```
pub fn normalize_threat_id(raw: &str) -> String {
    let id = raw.trim().to_uppercase();

    if id.contains("OWASP") || id.contains("LLM") {
        if let Some(m) = owasp_re().find(&id) {
            return m.as_str().to_string();
        }
    }

    if id.starts_with('T') {
        if let Some(caps) = atlas_re().captures(&id) {
            if caps.get(0).map(|m| m.start()) == Some(0) {
                return format!("AML.{}", &caps[1]);
            }
        }
    }

    id
}

/// Canonical keys referenced by one threat-mapping item.
///
/// OWASP and ATLAS items yield every identifier found in their text. Items
/// with no recognizable identifier (typically MAESTRO) yield their
/// upper-cased text.
pub fn extract_threat_ids(item: &str) -> Vec<String> {
    let upper = item.trim().to_uppercase();
    if upper.is_empty() {
        return Vec::new();
    }

    let mut ids: Vec<String> = owasp_re()
        .find_iter(&upper)
        .map(|m| m.as_str().to_string())
        .collect();
    ids.extend(
        atlas_re()
            .captures_iter(&upper)
            .map(|caps| format!("AML.{}", &caps[1])),
    );

    if ids.is_empty() {
        ids.push(upper);
    }
    ids.dedup();
    ids
}

/// Build the reverse index from normalized threat key to the ids of every
/// document that claims it. Id lists are sorted and deduplicated.
pub fn build_threat_index(documents: &[Document]) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for doc in documents {
        for mapping in &doc.threat_mappings {
            for item in &mapping.items {
                for key in extract_threat_ids(item) {
                    index
                        .entry(key)
                        .or_default()
                        .insert(doc.source_id.clone());
                }
            }
        }
    }

    index
        .into_iter()
        .map(|(k, ids)| (k, ids.into_iter().collect()))
        .collect()
}
