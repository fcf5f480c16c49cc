//! Index generations.
//!
//! A generation is one immutable snapshot of the knowledge base. On disk it
//! is a directory holding `index.sqlite` (documents and vector BLOBs) and
//! `manifest.json` (content version plus the derived artifacts). In memory
//! it is a [`Generation`], shared by readers through an `Arc`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use defense_kb_core::embedding::{blob_to_vec, vec_to_blob, Embedder};
use defense_kb_core::index::DocumentIndex;
use defense_kb_core::models::{Document, IdCacheEntry};
use defense_kb_core::stats::Statistics;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::BuildError;
use crate::security;

pub const INDEX_FILE: &str = "index.sqlite";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Provenance of one source file that fed a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub file_id: String,
    pub sha256: String,
}

/// Everything about a generation except its documents and vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub generation_id: String,
    pub content_version: String,
    pub built_at: DateTime<Utc>,
    pub document_count: usize,
    pub embedding_model: String,
    pub dims: usize,
    #[serde(default)]
    pub sources: Vec<SourceFile>,
    pub statistics: Statistics,
    /// Normalized threat id → ids of documents that claim it.
    pub threat_index: BTreeMap<String, Vec<String>>,
    pub id_cache: Vec<IdCacheEntry>,
}

impl Manifest {
    /// Whether queries embedded by `embedder` are comparable with the
    /// stored vectors. An embedder reporting zero dims is checked by model
    /// name only.
    pub fn embedded_with(&self, embedder: &dyn Embedder) -> bool {
        self.embedding_model == embedder.model_name()
            && (embedder.dims() == 0 || embedder.dims() == self.dims)
    }
}

#[derive(Debug)]
pub struct Generation {
    manifest: Manifest,
    index: DocumentIndex,
}

impl Generation {
    pub fn new(manifest: Manifest, index: DocumentIndex) -> Self {
        Self { manifest, index }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    pub fn id(&self) -> &str {
        &self.manifest.generation_id
    }

    pub fn content_version(&self) -> &str {
        &self.manifest.content_version
    }

    pub fn document_count(&self) -> usize {
        self.index.len()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.manifest.statistics
    }

    pub fn id_cache(&self) -> &[IdCacheEntry] {
        &self.manifest.id_cache
    }

    pub fn threat_index(&self) -> &BTreeMap<String, Vec<String>> {
        &self.manifest.threat_index
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.index.get(id)
    }

    /// Persist this generation into `dir`, which must already exist.
    pub async fn write(&self, dir: &Path) -> Result<(), BuildError> {
        let path = dir.join(INDEX_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let written = write_documents(&pool, &self.index).await;
        pool.close().await;
        written?;
        security::set_private_permissions(&path)?;

        let manifest = serde_json::to_vec_pretty(&self.manifest)?;
        security::write_private(&dir.join(MANIFEST_FILE), &manifest)?;
        Ok(())
    }

    /// Load a generation previously written with [`Generation::write`].
    pub async fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = tokio::fs::read(&manifest_path)
            .await
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

        let options = SqliteConnectOptions::new()
            .filename(dir.join(INDEX_FILE))
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open index in {}", dir.display()))?;

        let rows = sqlx::query("SELECT doc_json, embedding FROM documents ORDER BY position ASC")
            .fetch_all(&pool)
            .await;
        pool.close().await;
        let rows = rows?;

        let mut documents = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc_json: String = row.get("doc_json");
            let blob: Vec<u8> = row.get("embedding");
            documents.push(serde_json::from_str::<Document>(&doc_json)?);
            vectors.push(blob_to_vec(&blob));
        }

        let index = DocumentIndex::new(documents, vectors)?;
        if index.len() != manifest.document_count {
            bail!(
                "generation {} is corrupt: manifest lists {} documents, store holds {}",
                manifest.generation_id,
                manifest.document_count,
                index.len()
            );
        }

        Ok(Self { manifest, index })
    }
}

async fn write_documents(pool: &SqlitePool, index: &DocumentIndex) -> Result<(), BuildError> {
    sqlx::query(
        r#"
        CREATE TABLE documents (
            position INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL UNIQUE,
            doc_type TEXT NOT NULL,
            parent_id TEXT,
            doc_json TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let mut tx = pool.begin().await?;
    for (pos, (doc, vector)) in index.documents().iter().zip(index.vectors()).enumerate() {
        sqlx::query(
            "INSERT INTO documents (position, source_id, doc_type, parent_id, doc_json, embedding) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(pos as i64)
        .bind(&doc.source_id)
        .bind(doc.doc_type.as_str())
        .bind(doc.parent_id.as_deref())
        .bind(serde_json::to_string(doc)?)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use defense_kb_core::models::DocType;

    fn doc(id: &str) -> Document {
        Document {
            source_id: id.to_string(),
            doc_type: DocType::Technique,
            parent_id: None,
            name: id.to_string(),
            tactic: "Model".into(),
            pillar: String::new(),
            phase: String::new(),
            text: format!("Technique: {id}"),
            body: String::new(),
            threat_mappings: Vec::new(),
            tools_opensource: Vec::new(),
            tools_commercial: Vec::new(),
            implementation_strategies: Vec::new(),
            has_code: false,
        }
    }

    fn generation(docs: Vec<Document>) -> Generation {
        let vectors = (0..docs.len()).map(|i| vec![i as f32, 1.0]).collect();
        let statistics = Statistics::compute(&docs);
        let id_cache = docs.iter().map(Document::id_entry).collect();
        let index = DocumentIndex::new(docs, vectors).unwrap();
        Generation::new(
            Manifest {
                generation_id: "g1".into(),
                content_version: "a".repeat(40),
                built_at: Utc::now(),
                document_count: index.len(),
                embedding_model: "test".into(),
                dims: 2,
                sources: vec![SourceFile {
                    file_id: "model.js".into(),
                    sha256: "00".into(),
                }],
                statistics,
                threat_index: BTreeMap::new(),
                id_cache,
            },
            index,
        )
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let gen = generation(vec![doc("AID-M-001"), doc("AID-M-002")]);
        gen.write(dir.path()).await.unwrap();

        let loaded = Generation::load(dir.path()).await.unwrap();
        assert_eq!(loaded.document_count(), 2);
        assert_eq!(loaded.content_version(), "a".repeat(40));
        assert_eq!(loaded.index().documents(), gen.index().documents());
        assert_eq!(loaded.index().vectors(), gen.index().vectors());
        assert_eq!(loaded.id_cache().len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Generation::load(&dir.path().join("nope")).await.is_err());
    }

    struct Named(&'static str, usize);

    #[async_trait::async_trait]
    impl Embedder for Named {
        fn model_name(&self) -> &str {
            self.0
        }
        fn dims(&self) -> usize {
            self.1
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; self.1]).collect())
        }
    }

    #[test]
    fn test_embedded_with() {
        let gen = generation(vec![doc("AID-M-001")]);
        assert!(gen.manifest().embedded_with(&Named("test", 2)));
        assert!(gen.manifest().embedded_with(&Named("test", 0)));
        assert!(!gen.manifest().embedded_with(&Named("test", 4)));
        assert!(!gen.manifest().embedded_with(&Named("other", 2)));
    }
}
