//! Persisted sync record.
//!
//! `version.json` remembers which content version the active generation was
//! built from, when it was synced, and its statistics, so a restart does not
//! rebuild unchanged content and status can be reported without loading the
//! index.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use defense_kb_core::stats::Statistics;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::security;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub content_version: String,
    pub last_synced_at: DateTime<Utc>,
    pub document_count: usize,
    #[serde(default)]
    pub generation_id: String,
    #[serde(default)]
    pub statistics: Statistics,
}

pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored record, or `None` if it is missing or unreadable.
    pub fn load(&self) -> Option<VersionRecord> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read version record");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt version record");
                None
            }
        }
    }

    /// Replace the stored record atomically.
    pub fn save(&self, record: &VersionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        security::write_private(&tmp, &body)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
