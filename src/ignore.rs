//! Layered ignore evaluation. Decides, per path, whether it is
//! `Tracked` (indexed, shareable), `Overlay` (indexed, local-only), or
//! `Excluded`.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// Per-path classification, also observable externally via status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Tracked,
    Overlay,
    Ignored,
}

/// Default extended-ignore patterns that apply regardless of tracked
/// status: secrets, build output, and caches are never read, hashed, or
/// indexed even if a caller somehow tracks them.
pub const DEFAULT_EXTENDED_IGNORE: &[&str] = &[
    ".env*",
    "*.pem",
    "*.key",
    "*.crt",
    "*.p12",
    "__pycache__/**",
    "*.pyc",
    ".venv/**",
    "venv/**",
    "node_modules/**",
    "target/**",
    "dist/**",
    "build/**",
    "*.log",
    ".coverage",
    "htmlcov/**",
];

/// Lockfile patterns are excluded from the default extended-ignore set only
/// for the untracked/overlay tier: a lockfile already tracked by the VCS
/// driver is shareable and stays `Tracked`, matching the "local-only scratch
/// stays out, shared state stays in" framing of the overlay tier.
pub const DEFAULT_UNTRACKED_LOCKFILE_IGNORE: &[&str] = &["*.lock"];

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Evaluates the tracked-ignore layer (native VCS ignore file, applied by
/// the driver) against the daemon's extended-ignore layer and the opt-in
/// overlay allow-list.
pub struct IgnoreEngine {
    extended: GlobSet,
    untracked_lockfile: GlobSet,
    overlay_allow: GlobSet,
}

impl IgnoreEngine {
    /// `extended_patterns` is the daemon-maintained superset file's content
    /// (user-editable), appended to the fixed defaults. `overlay_allow`
    /// is the opt-in list of untracked paths eligible for local-only
    /// indexing.
    pub fn new(extended_patterns: &[String], overlay_allow: &[String]) -> Self {
        let mut extended: Vec<String> = DEFAULT_EXTENDED_IGNORE
            .iter()
            .map(|s| s.to_string())
            .collect();
        extended.extend_from_slice(extended_patterns);
        let untracked_lockfile: Vec<String> = DEFAULT_UNTRACKED_LOCKFILE_IGNORE
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            extended: build_globset(&extended),
            untracked_lockfile: build_globset(&untracked_lockfile),
            overlay_allow: build_globset(overlay_allow),
        }
    }

    /// Classify a path. `tracked` comes from the local VCS driver's
    /// tracked-entry enumeration (a path is `tracked` to this engine iff
    /// the driver reports it as such and it is not extended-ignored).
    pub fn classify(&self, path: &Path, tracked_by_vcs: bool) -> Classification {
        if self.extended.is_match(path) {
            return Classification::Ignored;
        }
        if tracked_by_vcs {
            return Classification::Tracked;
        }
        if self.untracked_lockfile.is_match(path) {
            return Classification::Ignored;
        }
        if self.overlay_allow.is_match(path) {
            return Classification::Overlay;
        }
        Classification::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn engine() -> IgnoreEngine {
        IgnoreEngine::new(&[], &["notes/**".to_string(), "*.local.md".to_string()])
    }

    #[test]
    fn extended_ignore_wins_over_overlay_allow() {
        let e = IgnoreEngine::new(&[], &[".env.local".to_string()]);
        assert_eq!(
            e.classify(&PathBuf::from(".env.local"), false),
            Classification::Ignored
        );
    }

    #[test]
    fn tracked_path_is_tracked_when_not_extended_ignored() {
        let e = engine();
        assert_eq!(
            e.classify(&PathBuf::from("src/main.rs"), true),
            Classification::Tracked
        );
    }

    #[test]
    fn opted_in_untracked_path_is_overlay() {
        let e = engine();
        assert_eq!(
            e.classify(&PathBuf::from("notes/todo.md"), false),
            Classification::Overlay
        );
    }

    #[test]
    fn untracked_non_opted_in_path_is_ignored() {
        let e = engine();
        assert_eq!(
            e.classify(&PathBuf::from("scratch/whatever.txt"), false),
            Classification::Ignored
        );
    }

    #[test]
    fn extended_ignore_blocks_tracked_path_too() {
        let e = IgnoreEngine::new(&[], &[]);
        assert_eq!(
            e.classify(&PathBuf::from("target/debug/foo"), true),
            Classification::Ignored
        );
    }

    #[test]
    fn cargo_lock_is_default_ignored_when_untracked() {
        let e = IgnoreEngine::new(&[], &["Cargo.lock".to_string()]);
        assert_eq!(
            e.classify(&PathBuf::from("Cargo.lock"), false),
            Classification::Ignored
        );
    }

    #[test]
    fn tracked_lockfile_stays_tracked() {
        let e = IgnoreEngine::new(&[], &[]);
        assert_eq!(
            e.classify(&PathBuf::from("Cargo.lock"), true),
            Classification::Tracked
        );
    }
}
