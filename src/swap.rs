//! Generation swap.
//!
//! Cuts a staging generation over to active while holding the engine writer
//! lock. The writer section does no I/O beyond the slot renames: the staging
//! generation is already fully loaded in memory, so installing it is a
//! pointer store.

use std::sync::Arc;

use crate::builder::StagingGeneration;
use crate::engine::QueryEngine;
use crate::error::SwapError;
use crate::slots::GenerationSlots;

pub struct SwapManager {
    engine: Arc<QueryEngine>,
    slots: Arc<dyn GenerationSlots>,
}

impl SwapManager {
    pub fn new(engine: Arc<QueryEngine>, slots: Arc<dyn GenerationSlots>) -> Self {
        Self { engine, slots }
    }

    /// Promote `staging` and make it the engine's active generation.
    ///
    /// On error the engine keeps serving the generation it had before, and
    /// the staging directory is discarded.
    pub async fn swap(&self, staging: StagingGeneration) -> Result<(), SwapError> {
        let StagingGeneration { dir, generation } = staging;
        let generation = Arc::new(generation);

        let started = std::time::Instant::now();
        let mut writer = self.engine.writer().await;

        let promoted = self.slots.promote(dir.path());
        match promoted {
            Ok(active) => {
                dir.commit();
                writer.install(Arc::clone(&generation));
                drop(writer);
                tracing::info!(
                    path = %active.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "swap complete"
                );
                Ok(())
            }
            Err(e) => {
                drop(writer);
                tracing::error!(error = %e, "swap failed; active generation unchanged");
                Err(e)
            }
        }
    }
}
