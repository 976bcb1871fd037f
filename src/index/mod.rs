//! The hybrid index: lexical token index, structural store, and
//! symbol/relation graph, updated within a single atomic swap per
//! reconciliation.

pub mod graph;
pub mod lexical;
pub mod structural;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};

/// Coordinates the shadow-directory atomic-swap update protocol: all writes land in a shadow directory; on success
/// the shadow and the active directory trade places via a single rename.
/// Readers always observe one revision or the other, never a partial one.
pub struct IndexDirectories {
    pub active: PathBuf,
    pub shadow: PathBuf,
}

impl IndexDirectories {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            active: state_dir.join("index-active"),
            shadow: state_dir.join("index-shadow"),
        }
    }

    /// Prepares a clean shadow directory to write a new revision into.
    pub fn prepare_shadow(&self) -> CoreResult<()> {
        if self.shadow.exists() {
            std::fs::remove_dir_all(&self.shadow)?;
        }
        std::fs::create_dir_all(&self.shadow)?;
        Ok(())
    }

    /// Atomically promotes the shadow directory to active. On crash
    /// between `prepare_shadow` and this call, the shadow is simply
    /// discarded on the next `prepare_shadow` and a full reindex is
    /// triggered by the caller.
    pub fn promote_shadow(&self) -> CoreResult<()> {
        let previous = self.active.with_extension("previous");
        if self.active.exists() {
            if previous.exists() {
                std::fs::remove_dir_all(&previous)?;
            }
            std::fs::rename(&self.active, &previous)?;
        }
        std::fs::rename(&self.shadow, &self.active)?;
        if previous.exists() {
            std::fs::remove_dir_all(&previous)?;
        }
        Ok(())
    }

    pub fn discard_shadow_on_restart(&self) {
        if self.shadow.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.shadow) {
                warn!(error = %e, "failed to discard stale shadow index directory");
            } else {
                info!("discarded stale shadow index directory from a prior crash");
            }
        }
    }
}

/// Verifies the active structural store's schema version; a mismatch is
/// treated exactly like a failed integrity check: the
/// index is discarded and rebuilt with a warning, not a fatal error.
pub fn verify_schema_or_signal_rebuild(found_version: i32) -> CoreResult<()> {
    if found_version != structural::SCHEMA_VERSION {
        return Err(CoreError::IndexCorruption(format!(
            "schema version mismatch: found {found_version}, expected {}",
            structural::SCHEMA_VERSION
        )));
    }
    Ok(())
}
