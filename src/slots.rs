//! On-disk generation slots.
//!
//! Two layouts are supported:
//!
//! - [`RenameSlots`]: `active/`, `retired/`, and `staging-<uuid>/` side by
//!   side. Promotion renames staging into `active/` after moving the old
//!   active generation to `retired/`.
//! - [`PointerSlots`]: every generation lives in `gens/<id>/` and a `CURRENT`
//!   file names the active one. Promotion rewrites `CURRENT` atomically.
//!
//! In both layouts at most one retired generation is kept for rollback.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SwapMode;
use crate::error::SwapError;

/// A staging directory that is removed on drop unless committed.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory: it now belongs to the slot layout.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.armed || !self.path.exists() {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed staging directory"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove staging directory"
            ),
        }
    }
}

pub trait GenerationSlots: Send + Sync {
    /// Create a fresh, empty staging directory.
    fn create_staging(&self) -> io::Result<StagingDir>;

    /// Directory of the active generation, if there is one.
    fn active_dir(&self) -> io::Result<Option<PathBuf>>;

    /// Directory of the retired generation, if there is one.
    fn retired_dir(&self) -> Option<PathBuf>;

    /// Make `staging` the active generation.
    ///
    /// On error the previously active generation is still active.
    fn promote(&self, staging: &Path) -> Result<PathBuf, SwapError>;

    /// Repair what an interrupted process left behind: undo a half-finished
    /// promotion and remove stale staging directories. Call before the
    /// first read.
    fn recover(&self);
}

pub fn open_slots(mode: SwapMode, index_dir: &Path) -> io::Result<Arc<dyn GenerationSlots>> {
    std::fs::create_dir_all(index_dir)?;
    Ok(match mode {
        SwapMode::Rename => Arc::new(RenameSlots::new(index_dir)),
        SwapMode::Pointer => Arc::new(PointerSlots::new(index_dir)?),
    })
}

fn staging_name() -> String {
    format!("staging-{}", uuid::Uuid::new_v4())
}

fn remove_stale_staging(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_staging = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with("staging-"));
        if is_staging {
            tracing::info!(path = %entry.path().display(), "removing stale staging directory");
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove stale staging");
            }
        }
    }
}

pub struct RenameSlots {
    root: PathBuf,
}

impl RenameSlots {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn active(&self) -> PathBuf {
        self.root.join("active")
    }

    fn retired(&self) -> PathBuf {
        self.root.join("retired")
    }
}

impl GenerationSlots for RenameSlots {
    fn create_staging(&self) -> io::Result<StagingDir> {
        StagingDir::create(self.root.join(staging_name()))
    }

    fn active_dir(&self) -> io::Result<Option<PathBuf>> {
        let active = self.active();
        Ok(active.is_dir().then_some(active))
    }

    fn retired_dir(&self) -> Option<PathBuf> {
        let retired = self.retired();
        retired.is_dir().then_some(retired)
    }

    fn promote(&self, staging: &Path) -> Result<PathBuf, SwapError> {
        let active = self.active();
        let retired = self.retired();

        if retired.exists() {
            if let Err(e) = std::fs::remove_dir_all(&retired) {
                tracing::warn!(error = %e, "failed to delete previous retired generation");
            }
        }

        let mut moved_to_retired = false;
        if active.exists() {
            match std::fs::rename(&active, &retired) {
                Ok(()) => moved_to_retired = true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to retire active generation; no rollback copy")
                }
            }
        }

        if let Err(source) = std::fs::rename(staging, &active) {
            if moved_to_retired {
                match std::fs::rename(&retired, &active) {
                    Ok(()) => tracing::warn!("promotion failed; restored previous active generation"),
                    Err(e) => tracing::error!(error = %e, "promotion failed and restore failed"),
                }
            }
            return Err(SwapError::Promote { source });
        }

        Ok(active)
    }

    fn recover(&self) {
        let active = self.active();
        let retired = self.retired();
        if !active.exists() && retired.is_dir() {
            match std::fs::rename(&retired, &active) {
                Ok(()) => tracing::warn!("found retired generation without an active one; restored it"),
                Err(e) => tracing::error!(error = %e, "failed to restore retired generation"),
            }
        }
        remove_stale_staging(&self.root);
    }
}

pub struct PointerSlots {
    root: PathBuf,
}

const CURRENT: &str = "CURRENT";
const RETIRED: &str = "RETIRED";

impl PointerSlots {
    pub fn new(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root.join("gens"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn gens(&self) -> PathBuf {
        self.root.join("gens")
    }

    fn read_pointer(&self, name: &str) -> Option<String> {
        let raw = std::fs::read_to_string(self.root.join(name)).ok()?;
        let id = raw.trim();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| id.to_string())
    }

    fn write_pointer(&self, name: &str, id: &str) -> io::Result<()> {
        let tmp = self.root.join(format!("{name}.tmp"));
        std::fs::write(&tmp, id)?;
        std::fs::rename(&tmp, self.root.join(name))
    }
}

impl GenerationSlots for PointerSlots {
    fn create_staging(&self) -> io::Result<StagingDir> {
        StagingDir::create(self.gens().join(staging_name()))
    }

    fn active_dir(&self) -> io::Result<Option<PathBuf>> {
        Ok(self
            .read_pointer(CURRENT)
            .map(|id| self.gens().join(id))
            .filter(|dir| dir.is_dir()))
    }

    fn retired_dir(&self) -> Option<PathBuf> {
        self.read_pointer(RETIRED)
            .map(|id| self.gens().join(id))
            .filter(|dir| dir.is_dir())
    }

    fn promote(&self, staging: &Path) -> Result<PathBuf, SwapError> {
        let not_in_gens = || SwapError::Promote {
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a generation directory", staging.display()),
            ),
        };
        if staging.parent() != Some(self.gens().as_path()) || !staging.is_dir() {
            return Err(not_in_gens());
        }
        let id = staging
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(not_in_gens)?
            .to_string();

        let current = self.read_pointer(CURRENT);
        let previous_retired = self.read_pointer(RETIRED);

        // RETIRED must never name a missing directory: move the pointer
        // first, delete the old generation after.
        let mut retired_recorded = false;
        if let Some(current) = &current {
            match self.write_pointer(RETIRED, current) {
                Ok(()) => retired_recorded = true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to record retired generation; no rollback copy")
                }
            }
        }

        if let Some(old) = previous_retired {
            if retired_recorded && Some(&old) != current.as_ref() && old != id {
                if let Err(e) = std::fs::remove_dir_all(self.gens().join(&old)) {
                    tracing::warn!(generation = %old, error = %e, "failed to delete previous retired generation");
                }
            }
        }

        self.write_pointer(CURRENT, &id)
            .map_err(|source| SwapError::Promote { source })?;

        Ok(staging.to_path_buf())
    }

    fn recover(&self) {
        let mut current = self.read_pointer(CURRENT);
        let retired = self.read_pointer(RETIRED);
        let live = |id: &String| self.gens().join(id).is_dir();
        if !current.as_ref().is_some_and(live) {
            if let Some(retired) = retired.as_ref().filter(|&id| live(id)) {
                match self.write_pointer(CURRENT, retired) {
                    Ok(()) => {
                        tracing::warn!(generation = %retired, "active generation missing; restored retired one");
                        current = Some(retired.clone());
                    }
                    Err(e) => tracing::error!(error = %e, "failed to restore retired generation"),
                }
            }
        }
        let Ok(entries) = std::fs::read_dir(self.gens()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Some(&name) == current.as_ref() || Some(&name) == retired.as_ref() {
                continue;
            }
            tracing::info!(path = %entry.path().display(), "removing unreferenced generation");
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove generation");
            }
        }
    }
}
