//! Query engine.
//!
//! Owns the single piece of mutable shared state: which [`Generation`] is
//! active. It sits behind a `tokio::sync::RwLock`. Every read takes the
//! reader side for the duration of its in-memory lookup. The writer side is
//! taken only for first-time initialization, explicit reload, and the swap
//! cut-over. A generation is replaced wholesale and never mutated, so a read
//! sees either the old generation or the new one in full.
//!
//! Lifecycle: `Uninitialized` → `Ready` | `Failed`. Only the writer path in
//! this module leaves `Uninitialized`.

use defense_kb_core::embedding::{embed_one, Embedder};
use defense_kb_core::lookup::{suggest_ids, IdSuggestion, DEFAULT_THRESHOLD};
use defense_kb_core::models::{Document, IdCacheEntry, SearchHit};
use defense_kb_core::stats::Statistics;
use defense_kb_core::threat::normalize_threat_id;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::config::RetrievalConfig;
use crate::error::EngineError;
use crate::generation::Generation;
use crate::lock::SyncLock;
use crate::security;
use crate::slots::GenerationSlots;

const NO_GENERATION: &str = "no index generation available; run a sync first";

#[derive(Debug, Clone)]
pub enum EngineState {
    Uninitialized,
    Ready(Arc<Generation>),
    Failed(String),
}

/// Documents that claim to defend against one threat.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatDefenses {
    pub threat_id: String,
    pub defenses: Vec<Document>,
}

pub struct QueryEngine {
    state: RwLock<EngineState>,
    initializing: AtomicBool,
    embedder: Arc<dyn Embedder>,
    slots: Arc<dyn GenerationSlots>,
    sync_lock: Arc<SyncLock>,
    retrieval: RetrievalConfig,
}

/// Exclusive access to the engine state, held across a swap cut-over.
pub struct EngineWriter<'a> {
    guard: RwLockWriteGuard<'a, EngineState>,
}

impl EngineWriter<'_> {
    pub fn install(&mut self, generation: Arc<Generation>) {
        tracing::info!(
            generation = %generation.id(),
            version = %generation.content_version(),
            documents = generation.document_count(),
            "activated generation"
        );
        *self.guard = EngineState::Ready(generation);
    }

    pub fn state(&self) -> &EngineState {
        &self.guard
    }
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        slots: Arc<dyn GenerationSlots>,
        sync_lock: Arc<SyncLock>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            state: RwLock::new(EngineState::Uninitialized),
            initializing: AtomicBool::new(false),
            embedder,
            slots,
            sync_lock,
            retrieval,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub async fn writer(&self) -> EngineWriter<'_> {
        EngineWriter {
            guard: self.state.write().await,
        }
    }

    /// Load the active generation from disk if the engine has never been
    /// initialized. A no-op once the engine has left `Uninitialized`.
    pub async fn initialize(&self) {
        let mut writer = self.writer().await;
        if !matches!(writer.state(), EngineState::Uninitialized) {
            return;
        }
        self.load_active(&mut writer).await;
    }

    /// Reload the active generation from disk regardless of current state.
    pub async fn reload(&self) {
        let mut writer = self.writer().await;
        self.load_active(&mut writer).await;
    }

    async fn load_active(&self, writer: &mut EngineWriter<'_>) {
        self.initializing.store(true, Ordering::SeqCst);
        let next = match self.slots.active_dir() {
            Ok(Some(dir)) => match Generation::load(&dir).await {
                Ok(generation) => Some(Ok(Arc::new(generation))),
                Err(e) => {
                    tracing::error!(path = %dir.display(), error = %e, "failed to load active generation");
                    Some(Err(format!("failed to load active generation: {e}")))
                }
            },
            Ok(None) => None,
            Err(e) => Some(Err(format!("failed to locate active generation: {e}"))),
        };

        match next {
            Some(Ok(generation)) => writer.install(generation),
            Some(Err(message)) => *writer.guard = EngineState::Failed(message),
            None => {
                tracing::info!("no active generation on disk");
                *writer.guard = EngineState::Failed(NO_GENERATION.to_string());
            }
        }
        self.initializing.store(false, Ordering::SeqCst);
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    pub async fn is_ready(&self) -> bool {
        matches!(&*self.state.read().await, EngineState::Ready(_))
    }

    /// The active generation, without triggering initialization.
    pub async fn current(&self) -> Option<Arc<Generation>> {
        match &*self.state.read().await {
            EngineState::Ready(generation) => Some(Arc::clone(generation)),
            _ => None,
        }
    }

    pub async fn state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    /// Run `f` against the active generation under the reader lock.
    async fn read<T>(&self, f: impl FnOnce(&Generation) -> T) -> Result<T, EngineError> {
        {
            let state = self.state.read().await;
            if let EngineState::Ready(generation) = &*state {
                return Ok(f(generation));
            }
        }

        if self.sync_lock.is_held() {
            return Err(EngineError::TemporarilyUnavailable {
                retry_after_secs: self.retrieval.retry_after_secs,
            });
        }

        self.initialize().await;

        let state = self.state.read().await;
        match &*state {
            EngineState::Ready(generation) => Ok(f(generation)),
            EngineState::Failed(message) => Err(EngineError::NotReady(message.clone())),
            EngineState::Uninitialized => Err(EngineError::NotReady(NO_GENERATION.to_string())),
        }
    }

    /// Similarity search over the active generation.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<SearchHit>, EngineError> {
        let query = security::validate_query_text(query, self.retrieval.max_query_chars)?;
        let top_k = security::validate_top_k(
            top_k.unwrap_or(self.retrieval.default_top_k),
            self.retrieval.max_top_k,
        )?;

        // Fail before paying for an embedding if nothing can be served.
        self.read(|generation| self.check_embedder(generation)).await??;

        let vector = embed_one(self.embedder.as_ref(), &query)
            .await
            .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let hits = self
            .read(|generation| {
                let dims = generation.index().dims();
                if vector.len() != dims {
                    return Err(EngineError::Embedding(format!(
                        "query vector has {} dims, index has {dims}",
                        vector.len()
                    )));
                }
                Ok(generation.index().search(&vector, top_k))
            })
            .await??;
        tracing::debug!(top_k, hits = hits.len(), "search");
        Ok(hits)
    }

    fn check_embedder(&self, generation: &Generation) -> Result<(), EngineError> {
        let manifest = generation.manifest();
        if manifest.embedded_with(self.embedder.as_ref()) {
            return Ok(());
        }
        Err(EngineError::NotReady(format!(
            "index was embedded with {} ({} dims) but queries use {} ({} dims); run a sync",
            manifest.embedding_model,
            manifest.dims,
            self.embedder.model_name(),
            self.embedder.dims()
        )))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Document, EngineError> {
        let id = id.trim();
        self.read(|generation| generation.get(id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn get_id_cache(&self) -> Result<Vec<IdCacheEntry>, EngineError> {
        self.read(|generation| generation.id_cache().to_vec()).await
    }

    pub async fn get_stats(&self) -> Result<Statistics, EngineError> {
        self.read(|generation| generation.statistics().clone()).await
    }

    /// Best fuzzy matches for a possibly mistyped document id.
    pub async fn suggest_ids(&self, query: &str, k: usize) -> Result<Vec<IdSuggestion>, EngineError> {
        let k = security::validate_top_k(k, self.retrieval.max_top_k)?;
        self.read(|generation| suggest_ids(query, generation.id_cache(), DEFAULT_THRESHOLD, k))
            .await
    }

    pub async fn defenses_for_threat(&self, threat_id: &str) -> Result<ThreatDefenses, EngineError> {
        let key = normalize_threat_id(threat_id);
        if key.is_empty() {
            return Err(EngineError::InvalidQuery("threat id must not be empty".into()));
        }

        let defenses = self
            .read(|generation| {
                generation
                    .threat_index()
                    .get(&key)
                    .map(|ids| ids.iter().filter_map(|id| generation.get(id).cloned()).collect::<Vec<_>>())
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no defenses recorded for {key}")))?;

        Ok(ThreatDefenses {
            threat_id: key,
            defenses,
        })
    }
}
