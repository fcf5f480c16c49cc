//! Component wiring.
//!
//! Builds the engine, orchestrator, and their shared sync lock from a
//! [`Config`]. [`Service::with_parts`] takes the transport and embedder
//! explicitly so tests can run the whole pipeline against fakes;
//! [`Service::with_slots`] also takes the slot layout.

use anyhow::{Context, Result};
use defense_kb_core::embedding::Embedder;
use std::sync::Arc;

use crate::builder::IndexBuilder;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::engine::QueryEngine;
use crate::fetch::{ContentFetcher, HttpTransport, Transport};
use crate::lock::SyncLock;
use crate::middleware::RateLimiter;
use crate::server::AppState;
use crate::slots::{open_slots, GenerationSlots};
use crate::sync::SyncOrchestrator;
use crate::version::VersionStore;

pub struct Service {
    pub config: Config,
    pub engine: Arc<QueryEngine>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Service {
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.upstream.user_agent)?;
        let embedder = create_embedder(&config.embedding)?;
        Self::with_parts(config, Arc::new(transport), embedder)
    }

    pub fn with_parts(config: Config, transport: Arc<dyn Transport>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let index_dir = config.data.index_dir();
        let slots = open_slots(config.sync.swap_mode, &index_dir)
            .with_context(|| format!("Failed to open index directory {}", index_dir.display()))?;
        Ok(Self::with_slots(config, transport, embedder, slots))
    }

    /// Wire the components over an already opened slot layout.
    pub fn with_slots(
        config: Config,
        transport: Arc<dyn Transport>,
        embedder: Arc<dyn Embedder>,
        slots: Arc<dyn GenerationSlots>,
    ) -> Self {
        slots.recover();

        let lock = SyncLock::new(config.sync.lock_timeout());
        let engine = Arc::new(QueryEngine::new(
            Arc::clone(&embedder),
            Arc::clone(&slots),
            Arc::clone(&lock),
            config.retrieval.clone(),
        ));

        let fetcher = ContentFetcher::new(transport, config.upstream.clone(), config.data.raw_dir());
        let builder = IndexBuilder::new(embedder, config.embedding.batch_size);
        let versions = VersionStore::new(config.data.version_file());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            fetcher,
            builder,
            Arc::clone(&engine),
            slots,
            versions,
            lock,
            config.sync.sync_timeout(),
        ));

        Self {
            config,
            engine,
            orchestrator,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.orchestrator),
            self.config.sync.interval(),
            self.config.retrieval.retry_after_secs,
            RateLimiter::from_config(&self.config.server),
        )
    }
}
