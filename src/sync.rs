//! Sync orchestrator.
//!
//! One pipeline run: resolve the upstream version, fetch every source file,
//! extract documents, build a staging generation, swap it in, and persist
//! the version record. The run is single-flight through [`SyncLock`] and the
//! active generation is untouched unless the swap succeeds.
//!
//! [`SyncOrchestrator::sync_loop`] repeats the pipeline on an interval until
//! its cancellation token fires.

use chrono::{DateTime, Utc};
use defense_kb_core::models::Document;
use defense_kb_core::stats::Statistics;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::builder::IndexBuilder;
use crate::engine::QueryEngine;
use crate::error::EngineError;
use crate::extract;
use crate::fetch::ContentFetcher;
use crate::generation::SourceFile;
use crate::lock::{SyncGuard, SyncLock};
use crate::logging::AUDIT_TARGET;
use crate::slots::GenerationSlots;
use crate::swap::SwapManager;
use crate::version::{VersionRecord, VersionStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Updated { version: String, documents: usize },
    UpToDate { version: String },
    AlreadyInProgress,
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Updated { .. } | SyncOutcome::UpToDate { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerResult {
    Accepted,
    AlreadyInProgress,
}

/// Mutable sync bookkeeping, owned by one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Most recent error, including per-file extraction failures of a run
    /// that still succeeded.
    pub last_error: Option<String>,
    /// Whether the most recent completed run failed.
    pub last_failed: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Statistics as served to readers, with their provenance.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub content_version: String,
    pub document_count: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub statistics: Statistics,
}

pub struct SyncOrchestrator {
    fetcher: ContentFetcher,
    builder: IndexBuilder,
    swap: SwapManager,
    engine: Arc<QueryEngine>,
    slots: Arc<dyn GenerationSlots>,
    versions: VersionStore,
    lock: Arc<SyncLock>,
    sync_timeout: Duration,
    state: Mutex<SyncState>,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: ContentFetcher,
        builder: IndexBuilder,
        engine: Arc<QueryEngine>,
        slots: Arc<dyn GenerationSlots>,
        versions: VersionStore,
        lock: Arc<SyncLock>,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            builder,
            swap: SwapManager::new(Arc::clone(&engine), Arc::clone(&slots)),
            engine,
            slots,
            versions,
            lock,
            sync_timeout,
            state: Mutex::new(SyncState::default()),
        }
    }

    fn state_mut(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SyncState {
        self.state_mut().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state_mut().last_error.clone()
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.lock.is_held()
    }

    pub fn version_record(&self) -> Option<VersionRecord> {
        self.versions.load()
    }

    /// Run the pipeline once; `true` on an update or a no-op.
    pub async fn run_sync(&self) -> bool {
        self.sync().await.is_success()
    }

    pub async fn sync(&self) -> SyncOutcome {
        let Some(guard) = self.lock.try_acquire() else {
            tracing::info!("sync already in progress");
            return SyncOutcome::AlreadyInProgress;
        };
        self.sync_with_guard(guard).await
    }

    /// Start a sync in the background unless one is already running.
    pub fn trigger_sync(self: &Arc<Self>) -> TriggerResult {
        let Some(guard) = self.lock.try_acquire() else {
            return TriggerResult::AlreadyInProgress;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.sync_with_guard(guard).await;
            tracing::debug!(?outcome, "triggered sync finished");
        });
        TriggerResult::Accepted
    }

    async fn sync_with_guard(&self, guard: SyncGuard) -> SyncOutcome {
        {
            let mut state = self.state_mut();
            state.last_attempt_at = Some(Utc::now());
            state.last_error = None;
        }

        let result = match tokio::time::timeout(self.sync_timeout, self.pipeline(&guard)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "sync timed out after {}s",
                self.sync_timeout.as_secs()
            )),
        };

        let outcome = match result {
            Ok(outcome) => {
                self.state_mut().last_failed = false;
                outcome
            }
            Err(error) => {
                tracing::error!(error = %error, "sync failed");
                self.record_failure(&error);
                SyncOutcome::Failed { error }
            }
        };
        tracing::info!(target: AUDIT_TARGET, outcome = ?outcome, "sync");
        outcome
    }

    fn record_failure(&self, error: &str) {
        let mut state = self.state_mut();
        state.last_error = Some(error.to_string());
        state.last_failed = true;
    }

    async fn pipeline(&self, guard: &SyncGuard) -> Result<SyncOutcome, String> {
        tracing::info!("sync started");

        let version = self
            .fetcher
            .latest_version()
            .await
            .map_err(|e| format!("failed to resolve latest version: {e}"))?;

        let has_active = matches!(self.slots.active_dir(), Ok(Some(_)));
        if let Some(record) = self.versions.load() {
            if record.content_version == version && has_active {
                if !self.engine.is_ready().await {
                    self.engine.reload().await;
                }
                let embedder = self.engine.embedder();
                match self.engine.current().await {
                    Some(active) if active.manifest().embedded_with(embedder.as_ref()) => {
                        tracing::info!(version = %version, "content up to date");
                        return Ok(SyncOutcome::UpToDate { version });
                    }
                    Some(active) => tracing::info!(
                        version = %version,
                        index_model = %active.manifest().embedding_model,
                        index_dims = active.manifest().dims,
                        model = %embedder.model_name(),
                        dims = embedder.dims(),
                        "embedding model changed; rebuilding"
                    ),
                    None => tracing::warn!(
                        version = %version,
                        "active generation could not be loaded; rebuilding"
                    ),
                }
            }
        }

        let files = self
            .fetcher
            .fetch_all(&version)
            .await
            .map_err(|e| format!("fetch failed: {e}"))?;

        let (documents, sources) = self.extract_all(&files).await?;

        let staging = self
            .slots
            .create_staging()
            .map_err(|e| format!("failed to create staging directory: {e}"))?;
        let staged = self
            .builder
            .build(documents, &version, sources, staging)
            .await
            .map_err(|e| format!("build failed: {e}"))?;

        let document_count = staged.generation.document_count();
        let record = VersionRecord {
            content_version: version.clone(),
            last_synced_at: Utc::now(),
            document_count,
            generation_id: staged.generation.id().to_string(),
            statistics: staged.generation.statistics().clone(),
        };

        if !guard.is_current() {
            return Err("sync lock was force-released; discarding this build".to_string());
        }

        self.swap
            .swap(staged)
            .await
            .map_err(|e| format!("swap failed: {e}"))?;

        self.versions
            .save(&record)
            .map_err(|e| format!("failed to persist version record: {e}"))?;
        self.fetcher.prune(&version);

        tracing::info!(version = %version, documents = document_count, "sync complete");
        Ok(SyncOutcome::Updated {
            version,
            documents: document_count,
        })
    }

    /// Extract every fetched file. A file that fails is recorded and
    /// skipped; the run aborts only if none succeed.
    async fn extract_all(
        &self,
        files: &[crate::fetch::FetchedFile],
    ) -> Result<(Vec<Document>, Vec<SourceFile>), String> {
        let mut documents = Vec::new();
        let mut sources = Vec::new();
        let mut last_failure = None;

        for file in files {
            let path = file.path.clone();
            let extracted = tokio::task::spawn_blocking(move || extract::extract(&path))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));

            match extracted {
                Ok(docs) => {
                    tracing::info!(file = %file.file_id, documents = docs.len(), "extracted source file");
                    documents.extend(docs);
                    sources.push(SourceFile {
                        file_id: file.file_id.clone(),
                        sha256: file.sha256.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(file = %file.file_id, error = %e, "extraction failed; skipping file");
                    last_failure = Some(format!("{}: {e}", file.file_id));
                }
            }
        }

        if sources.is_empty() {
            let detail = last_failure.unwrap_or_else(|| "no source files".to_string());
            return Err(format!("all source files failed extraction; last error: {detail}"));
        }
        if let Some(failure) = last_failure {
            self.state_mut().last_error = Some(failure);
        }

        Ok((documents, sources))
    }

    /// Statistics from the persisted record when it describes the active
    /// generation, otherwise from the generation itself.
    pub async fn get_stats(&self) -> Result<StatsReport, EngineError> {
        let record = self.versions.load();
        let current = match self.engine.current().await {
            Some(generation) => generation,
            None => {
                self.engine.get_stats().await?;
                self.engine
                    .current()
                    .await
                    .ok_or_else(|| EngineError::NotReady("no active generation".into()))?
            }
        };

        match record {
            Some(record) if record.content_version == current.content_version() => Ok(StatsReport {
                content_version: record.content_version,
                document_count: record.document_count,
                last_synced_at: Some(record.last_synced_at),
                statistics: record.statistics,
            }),
            _ => Ok(StatsReport {
                content_version: current.content_version().to_string(),
                document_count: current.document_count(),
                last_synced_at: None,
                statistics: current.statistics().clone(),
            }),
        }
    }

    /// Run [`SyncOrchestrator::sync`] every `interval` until `cancel` fires.
    ///
    /// A cycle that errors, panics, or times out is logged and the loop
    /// continues. Cancellation is checked around the sleep; an in-flight
    /// cycle runs to completion or to its timeout.
    pub async fn sync_loop(self: Arc<Self>, interval: Duration, run_immediately: bool, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "sync loop started");
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !(first && run_immediately) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            first = false;
            if cancel.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.sync()).catch_unwind().await {
                Ok(outcome) => tracing::debug!(?outcome, "sync cycle finished"),
                Err(_) => {
                    tracing::error!("sync cycle panicked");
                    self.record_failure("sync cycle panicked");
                }
            }
        }

        tracing::info!("sync loop stopped");
    }
}
