//! Core data models used throughout defense-kb.
//!
//! A [`Document`] is one node of the technique → sub-technique → strategy
//! hierarchy. Documents are immutable once extracted and are regenerated
//! wholesale on every sync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Level of a document in the framework hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Technique,
    Subtechnique,
    Strategy,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Technique => "technique",
            DocType::Subtechnique => "subtechnique",
            DocType::Strategy => "strategy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "technique" => Some(DocType::Technique),
            "subtechnique" => Some(DocType::Subtechnique),
            "strategy" => Some(DocType::Strategy),
            _ => None,
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framework's threat references claimed by a document
/// (e.g. `framework = "OWASP LLM Top 10"`, `items = ["LLM01:2025 Prompt Injection"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMapping {
    pub framework: String,
    pub items: Vec<String>,
}

/// A raw implementation strategy as it appears in the source, markup intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationStrategy {
    pub strategy: String,
    pub how_to: String,
}

/// A searchable document.
///
/// `parent_id` is a back-reference by ID only; documents never own their
/// children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable, globally unique identifier (e.g. `AID-H-001.002.S1`).
    pub source_id: String,
    pub doc_type: DocType,
    pub parent_id: Option<String>,
    pub name: String,
    /// Grouping tag: the tactic the document belongs to.
    pub tactic: String,
    pub pillar: String,
    pub phase: String,
    /// Plain text sent to the embedding service.
    pub text: String,
    /// Original formatted body, kept for human-facing display.
    pub body: String,
    pub threat_mappings: Vec<ThreatMapping>,
    pub tools_opensource: Vec<String>,
    pub tools_commercial: Vec<String>,
    pub implementation_strategies: Vec<ImplementationStrategy>,
    pub has_code: bool,
}

impl Document {
    /// Flattened `{id, name, type, tactic}` projection used by the id cache.
    pub fn id_entry(&self) -> IdCacheEntry {
        IdCacheEntry {
            source_id: self.source_id.clone(),
            name: self.name.clone(),
            doc_type: self.doc_type,
            tactic: self.tactic.clone(),
        }
    }
}

/// Entry of the flattened id cache kept on every generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCacheEntry {
    pub source_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub tactic: String,
}

/// Categorical metadata returned alongside each search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitMetadata {
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub name: String,
    pub pillar: String,
    pub phase: String,
    pub parent_id: Option<String>,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub tactic: String,
    pub text: String,
    pub metadata: HitMetadata,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is closer.
    pub score: f32,
}

impl SearchHit {
    pub fn from_document(doc: &Document, score: f32) -> Self {
        Self {
            id: doc.source_id.clone(),
            tactic: doc.tactic.clone(),
            text: doc.text.clone(),
            metadata: HitMetadata {
                doc_type: doc.doc_type,
                name: doc.name.clone(),
                pillar: doc.pillar.clone(),
                phase: doc.phase.clone(),
                parent_id: doc.parent_id.clone(),
            },
            score,
        }
    }
}
