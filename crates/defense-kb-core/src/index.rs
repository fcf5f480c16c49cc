//! In-memory vector + metadata index for one generation.
//!
//! Vector search is brute-force cosine similarity over every stored vector.
//! The index is built once and never mutated, so readers share it through
//! an `Arc` without any per-read locking.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::embedding::cosine_similarity;
use crate::models::{Document, SearchHit};

/// Documents and their vectors, addressable by position and by `source_id`.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    documents: Vec<Document>,
    vectors: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
    dims: usize,
}

impl DocumentIndex {
    /// Build an index from parallel document and vector lists.
    ///
    /// Fails if the lists differ in length, if vector dimensionality is not
    /// uniform, or if two documents share a `source_id`.
    pub fn new(documents: Vec<Document>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if documents.len() != vectors.len() {
            bail!(
                "document/vector count mismatch: {} documents, {} vectors",
                documents.len(),
                vectors.len()
            );
        }

        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if let Some((pos, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
            bail!(
                "vector {} has {} dims, expected {}",
                documents[pos].source_id,
                v.len(),
                dims
            );
        }

        let mut by_id = HashMap::with_capacity(documents.len());
        for (pos, doc) in documents.iter().enumerate() {
            if by_id.insert(doc.source_id.clone(), pos).is_some() {
                bail!("duplicate document id: {}", doc.source_id);
            }
        }

        Ok(Self {
            documents,
            vectors,
            by_id,
            dims,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.by_id.get(id).map(|&pos| &self.documents[pos])
    }

    /// Return the `k` documents closest to `query_vec`, best first.
    ///
    /// Ties are broken by `source_id` so results are deterministic.
    pub fn search(&self, query_vec: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || self.documents.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(pos, v)| (pos, cosine_similarity(query_vec, v)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.documents[a.0]
                        .source_id
                        .cmp(&self.documents[b.0].source_id)
                })
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(pos, score)| SearchHit::from_document(&self.documents[pos], score))
            .collect()
    }
}
