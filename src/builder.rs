//! Index builder.
//!
//! Turns extracted documents into a complete staging generation: embeds every
//! document's text in batches, derives the id cache, threat index, and
//! statistics, and writes it all into a staging directory. Nothing here
//! touches the active generation.

use chrono::Utc;
use defense_kb_core::embedding::Embedder;
use defense_kb_core::index::DocumentIndex;
use defense_kb_core::models::Document;
use defense_kb_core::stats::Statistics;
use defense_kb_core::threat::build_threat_index;
use std::sync::Arc;

use crate::error::BuildError;
use crate::generation::{Generation, Manifest, SourceFile};
use crate::slots::StagingDir;

/// A fully written generation that has not been promoted yet.
///
/// Dropping it removes the staging directory.
#[derive(Debug)]
pub struct StagingGeneration {
    pub dir: StagingDir,
    pub generation: Generation,
}

pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn build(
        &self,
        documents: Vec<Document>,
        content_version: &str,
        sources: Vec<SourceFile>,
        staging: StagingDir,
    ) -> Result<StagingGeneration, BuildError> {
        if documents.is_empty() {
            return Err(BuildError::Empty);
        }

        let vectors = self.embed_all(&documents).await?;
        let dims = vectors.first().map(Vec::len).unwrap_or_default();
        if dims == 0 {
            return Err(BuildError::Embedding("embedding service returned empty vectors".into()));
        }

        let statistics = Statistics::compute(&documents);
        let threat_index = build_threat_index(&documents);
        let id_cache = documents.iter().map(Document::id_entry).collect();

        let index =
            DocumentIndex::new(documents, vectors).map_err(|e| BuildError::Index(e.to_string()))?;

        let manifest = Manifest {
            generation_id: uuid::Uuid::new_v4().to_string(),
            content_version: content_version.to_string(),
            built_at: Utc::now(),
            document_count: index.len(),
            embedding_model: self.embedder.model_name().to_string(),
            dims,
            sources,
            statistics,
            threat_index,
            id_cache,
        };
        let generation = Generation::new(manifest, index);
        generation.write(staging.path()).await?;

        tracing::info!(
            generation = %generation.id(),
            version = %content_version,
            documents = generation.document_count(),
            dims,
            "built staging generation"
        );

        Ok(StagingGeneration {
            dir: staging,
            generation,
        })
    }

    async fn embed_all(&self, documents: &[Document]) -> Result<Vec<Vec<f32>>, BuildError> {
        let mut vectors = Vec::with_capacity(documents.len());
        let total_batches = documents.len().div_ceil(self.batch_size);

        for (i, batch) in documents.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embedded = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| BuildError::Embedding(e.to_string()))?;

            if embedded.len() != texts.len() {
                return Err(BuildError::VectorCount {
                    expected: texts.len(),
                    got: embedded.len(),
                });
            }
            vectors.extend(embedded);
            tracing::debug!(batch = i + 1, total_batches, "embedded batch");
        }

        Ok(vectors)
    }
}
