//! Reconciliation engine: the stat-then-hash pass that brings the
//! index into agreement with on-disk and version-control truth, without
//! file-system watchers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::hash::ObjectHash;
use crate::ignore::{Classification, IgnoreEngine};
use crate::utils::HashAlgorithm;
use crate::vcs::{current_version, LocalVcs, RepoVersion, StatMeta};

/// Line-ending form a file's bytes were found in on disk. Preserved so a
/// mutation never changes terminator style unintentionally; used only for
/// hashing decisions here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEnding {
    Lf,
    CrLf,
    Mixed,
}

pub(crate) fn detect_line_ending(bytes: &[u8]) -> LineEnding {
    let mut saw_crlf = false;
    let mut saw_lf = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            if i > 0 && bytes[i - 1] == b'\r' {
                saw_crlf = true;
            } else {
                saw_lf = true;
            }
        }
        i += 1;
    }
    match (saw_crlf, saw_lf) {
        (true, true) => LineEnding::Mixed,
        (true, false) => LineEnding::CrLf,
        _ => LineEnding::Lf,
    }
}

fn normalize_to_lf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            out.push(b'\n');
            i += 2;
        } else if bytes[i] == b'\r' {
            out.push(b'\n');
            i += 1;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// Content hash of `bytes` with line endings normalized to LF for hashing
/// purposes only (the bytes on disk are never altered by this function).
pub fn content_hash_normalized(bytes: &[u8]) -> ObjectHash {
    let normalized = normalize_to_lf(bytes);
    let mut hasher = HashAlgorithm::new();
    std::io::Write::write_all(&mut hasher, &normalized).expect("in-memory hashing cannot fail");
    let digest = hasher.finalize();
    ObjectHash::from_bytes(&digest).expect("digest length matches configured hash kind")
}

/// One entry in the reconciled path table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: PathBuf,
    pub classification: Classification,
    pub stat: StatMeta,
    pub content_hash: ObjectHash,
    pub line_ending: LineEnding,
}

/// Deterministic result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub renamed: Vec<(PathBuf, PathBuf)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
    }

    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        out.extend(self.added.iter().cloned());
        out.extend(self.modified.iter().cloned());
        out.extend(self.deleted.iter().cloned());
        for (from, to) in &self.renamed {
            out.push(from.clone());
            out.push(to.clone());
        }
        out
    }
}

fn stat_for(path: &Path) -> CoreResult<StatMeta> {
    let meta = fs::symlink_metadata(path)?;
    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let inode = 0u64;
    let mtime_nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(StatMeta {
        mtime_nanos,
        size: meta.len(),
        inode,
    })
}

/// Reads a path's bytes for hashing. Symlinks are opaque: their "content"
/// is the link target string, never the referent.
fn read_for_hash(path: &Path) -> CoreResult<Vec<u8>> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        Ok(target.to_string_lossy().into_owned().into_bytes())
    } else {
        Ok(fs::read(path)?)
    }
}

/// Brings the index's path table into agreement with on-disk and
/// version-control truth. Stateless apart from `last_seen_version` and the
/// cached path table.
pub struct ReconciliationEngine {
    vcs: Arc<dyn LocalVcs>,
    ignore: IgnoreEngine,
    repo_root: PathBuf,
    last_seen_version: DashMap<(), RepoVersion>,
    known: DashMap<PathBuf, PathEntry>,
    last_seen_submodule_heads: DashMap<PathBuf, String>,
}

impl ReconciliationEngine {
    pub fn new(vcs: Arc<dyn LocalVcs>, ignore: IgnoreEngine, repo_root: PathBuf) -> Self {
        Self {
            vcs,
            ignore,
            repo_root,
            last_seen_version: DashMap::new(),
            known: DashMap::new(),
            last_seen_submodule_heads: DashMap::new(),
        }
    }

    pub fn current_version(&self) -> CoreResult<RepoVersion> {
        current_version(self.vcs.as_ref())
    }

    /// Whether a fresh `current_version()` call is byte-identical to the
    /// last one this engine sealed — a cheap short-circuit for the
    /// reconcile-twice-is-empty invariant.
    pub fn is_unchanged_since_last_reconcile(&self) -> CoreResult<bool> {
        let fresh = self.current_version()?.seal();
        Ok(self
            .last_seen_version
            .get(&())
            .map(|v| v.seal() == fresh)
            .unwrap_or(false))
    }

    /// Deterministic reconciliation pass.
    pub fn reconcile(&self) -> CoreResult<ChangeSet> {
        info!("reconciliation starting");
        let version = self.current_version().map_err(|e| {
            CoreError::VcsMetadataFault(format!("failed to read repo version: {e}"))
        })?;

        let tracked = self
            .vcs
            .tracked_entries()
            .map_err(|e| CoreError::VcsMetadataFault(e.to_string()))?;

        let mut current_paths: HashMap<PathBuf, (Classification, StatMeta)> = HashMap::new();
        for entry in &tracked {
            let class = self.ignore.classify(&entry.path, true);
            if class == Classification::Ignored {
                continue;
            }
            current_paths.insert(entry.path.clone(), (class, entry.stat));
        }

        let untracked = self
            .vcs
            .walk_untracked(&self.repo_root)
            .unwrap_or_default();
        for path in untracked {
            let class = self.ignore.classify(&path, false);
            if class == Classification::Overlay {
                if let Ok(stat) = stat_for(&self.repo_root.join(&path)) {
                    current_paths.insert(path, (Classification::Overlay, stat));
                }
            }
        }

        // Submodules whose head moved since the last reconcile are reconciled
        // recursively: every cached entry under the submodule's path is
        // forced through the hash step regardless of its stat tuple, since a
        // checked-out commit swap can leave mtimes unchanged on some
        // filesystems. Uninitialized submodules (absent from this pass)
        // are skipped silently.
        let mut changed_submodule_prefixes: Vec<PathBuf> = Vec::new();
        for (path, head) in &version.submodule_heads {
            let changed = self
                .last_seen_submodule_heads
                .get(path)
                .map(|prev| *prev != *head)
                .unwrap_or(true);
            if changed {
                debug!(path = %path.display(), head = %head, "submodule head changed, reconciling recursively");
                changed_submodule_prefixes.push(path.clone());
            }
        }

        // Parallel stat-then-hash pass: only entries whose stat tuple
        // differs from the cached one (or that are new) pay for a hash.
        let to_check: Vec<(PathBuf, Classification, StatMeta)> = current_paths
            .iter()
            .map(|(p, (c, s))| (p.clone(), *c, *s))
            .collect();

        let results: Vec<(PathBuf, Classification, StatMeta, Option<ObjectHash>, LineEnding)> =
            to_check
                .into_par_iter()
                .map(|(path, class, stat)| {
                    let under_changed_submodule = changed_submodule_prefixes
                        .iter()
                        .any(|prefix| path.starts_with(prefix));
                    if let Some(existing) = self.known.get(&path) {
                        if !under_changed_submodule && existing.stat == stat {
                            return (
                                path,
                                class,
                                stat,
                                Some(existing.content_hash),
                                existing.line_ending,
                            );
                        }
                    }
                    let full_path = self.repo_root.join(&path);
                    match read_for_hash(&full_path) {
                        Ok(bytes) => {
                            let line_ending = detect_line_ending(&bytes);
                            let hash = content_hash_normalized(&bytes);
                            (path, class, stat, Some(hash), line_ending)
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to read path during reconciliation");
                            (path, class, stat, None, LineEnding::Lf)
                        }
                    }
                })
                .collect();

        let mut change_set = ChangeSet::default();
        let mut still_present = std::collections::HashSet::new();

        for (path, class, stat, hash, line_ending) in results {
            let Some(hash) = hash else { continue };
            still_present.insert(path.clone());
            match self.known.get(&path) {
                None => {
                    change_set.added.push(path.clone());
                }
                Some(existing) => {
                    if existing.content_hash != hash {
                        change_set.modified.push(path.clone());
                    }
                }
            }
            self.known.insert(
                path.clone(),
                PathEntry {
                    path,
                    classification: class,
                    stat,
                    content_hash: hash,
                    line_ending,
                },
            );
        }

        let deleted: Vec<PathBuf> = self
            .known
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| !still_present.contains(p))
            .collect();
        let mut deleted_hashes: HashMap<PathBuf, ObjectHash> = HashMap::new();
        for path in &deleted {
            if let Some((_, entry)) = self.known.remove(path) {
                deleted_hashes.insert(entry.path, entry.content_hash);
            }
        }
        change_set.deleted = deleted;

        reconcile_renames(&mut change_set, &deleted_hashes, &self.known);

        for (path, head) in &version.submodule_heads {
            self.last_seen_submodule_heads
                .insert(path.clone(), head.clone());
        }

        self.last_seen_version.insert((), version);
        info!(
            added = change_set.added.len(),
            modified = change_set.modified.len(),
            deleted = change_set.deleted.len(),
            renamed = change_set.renamed.len(),
            "reconciliation complete"
        );
        Ok(change_set)
    }
}

/// Collapses an exact delete+add pair with identical content hash into a
/// single rename.
fn reconcile_renames(
    change_set: &mut ChangeSet,
    deleted_hashes: &HashMap<PathBuf, ObjectHash>,
    known: &DashMap<PathBuf, PathEntry>,
) {
    if change_set.added.is_empty() || change_set.deleted.is_empty() {
        return;
    }
    let mut added_by_hash: HashMap<ObjectHash, PathBuf> = HashMap::new();
    for path in &change_set.added {
        if let Some(entry) = known.get(path) {
            added_by_hash.insert(entry.content_hash, path.clone());
        }
    }

    let mut renamed_deleted = Vec::new();
    let mut renamed_added = Vec::new();
    for (deleted_path, hash) in deleted_hashes {
        if let Some(added_path) = added_by_hash.get(hash) {
            change_set
                .renamed
                .push((deleted_path.clone(), added_path.clone()));
            renamed_deleted.push(deleted_path.clone());
            renamed_added.push(added_path.clone());
        }
    }
    change_set
        .deleted
        .retain(|p| !renamed_deleted.contains(p));
    change_set
        .added
        .retain(|p| !renamed_added.contains(p));
}
