//! Mutation engine: locked, scoped, atomic per-file writes that
//! produce a structured [`MutationDelta`]. Batch atomicity is explicitly
//! NOT promised — a failure partway through
//! step 4 leaves already-replaced files replaced, and the delta partitions
//! applied from not-applied files.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::diff::count_line_changes;
use crate::errors::{CoreError, CoreResult};
use crate::hash::ObjectHash;
use crate::ignore::{Classification, IgnoreEngine};
use crate::ledger::DiffStats;
use crate::reconcile::{content_hash_normalized, detect_line_ending, LineEnding};
use crate::vcs::{LocalVcs, RepoVersion, StatMeta};

/// A precondition a caller attaches to a single-file edit: either
/// the content hash it last observed, or a stat tuple. Mismatch aborts the
/// whole batch before any write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Precondition {
    Hash(ObjectHash),
    Stat(StatMeta),
}

/// A half-open line-column position, 1-based line, 0-based byte column
/// within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCol {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRange {
    pub start: LineCol,
    pub end: LineCol,
}

/// One textual edit: replace everything in `range` with `replacement`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: EditRange,
    pub replacement: String,
    /// Set by the refactor engine when this edit came from a semantic
    /// rename rather than a client-authored edit; carries the symbol it
    /// affects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_symbol_id: Option<String>,
}

/// One file's worth of edits plus the precondition guarding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: PathBuf,
    pub precondition: Precondition,
    pub edits: Vec<TextEdit>,
}

/// An edit batch: independent per-file edits plus an allow-list scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditBatch {
    pub edits: Vec<FileEdit>,
    /// Tracked-file renames to bookkeep via the VCS driver after content
    /// edits succeed.
    pub renames: Vec<(PathBuf, PathBuf)>,
}

/// Scope: an allow-list of paths or directory prefixes an operation may
/// touch.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub allowed: Vec<PathBuf>,
}

impl Scope {
    pub fn allows(&self, path: &Path) -> bool {
        self.allowed.iter().any(|a| path.starts_with(a) || path == a)
    }
}

/// Per-file delta as recorded in the structured result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDelta {
    pub path: PathBuf,
    pub old_hash: Option<ObjectHash>,
    pub new_hash: ObjectHash,
    pub line_ending: LineEnding,
    pub edits: Vec<TextEdit>,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// The complete structured record of a mutation's effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationDelta {
    pub mutation_id: Uuid,
    pub files: Vec<FileDelta>,
    pub symbols_changed: Vec<String>,
    pub tests_affected: Vec<String>,
    pub repo_before: RepoVersion,
    pub repo_after: RepoVersion,
    /// Files the caller asked to edit but that were not applied because an
    /// earlier file in the batch failed mid-replace. Empty on a fully successful batch.
    pub not_applied: Vec<PathBuf>,
}

impl MutationDelta {
    pub fn changed_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Aggregate per-file line counts into the summary shape the ledger stores.
    pub fn diff_stats(&self) -> DiffStats {
        let mut stats = DiffStats {
            files_changed: self.files.len() as u32,
            lines_added: 0,
            lines_removed: 0,
        };
        for file in &self.files {
            stats.lines_added += file.lines_added;
            stats.lines_removed += file.lines_removed;
        }
        stats
    }
}

/// Consulted by the mutation engine, post-apply, to fill in the delta's
/// `symbols_changed`/`tests_affected` summaries. Implemented against the
/// structural store and test scheduler by the daemon that wires this
/// engine together; a no-op default is fine when those aren't available.
pub trait ImpactAnalyzer: Send + Sync {
    fn symbols_changed(&self, paths: &[PathBuf]) -> Vec<String> {
        let _ = paths;
        Vec::new()
    }
    fn tests_affected(&self, paths: &[PathBuf]) -> Vec<String> {
        let _ = paths;
        Vec::new()
    }
}

/// A no-op analyzer for callers that don't wire in the index/scheduler.
pub struct NoImpactAnalysis;
impl ImpactAnalyzer for NoImpactAnalysis {}

fn stat_of(path: &Path) -> CoreResult<StatMeta> {
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

pub(crate) fn line_col_to_offset(text: &str, pos: LineCol) -> usize {
    let mut offset = 0usize;
    let mut line = 1u32;
    for ch in text.char_indices() {
        if line == pos.line {
            offset = ch.0;
            break;
        }
        if ch.1 == '\n' {
            line += 1;
        }
    }
    if line < pos.line {
        offset = text.len();
    }
    (offset + pos.col as usize).min(text.len())
}

/// Applies a set of non-overlapping edits to `original`, replacing each
/// range's text. Edits are applied back-to-front so earlier offsets stay
/// valid.
pub(crate) fn apply_edits(original: &str, edits: &[TextEdit]) -> String {
    let mut ranges: Vec<(usize, usize, &str)> = edits
        .iter()
        .map(|e| {
            let start = line_col_to_offset(original, e.range.start);
            let end = line_col_to_offset(original, e.range.end);
            (start.min(end), start.max(end), e.replacement.as_str())
        })
        .collect();
    ranges.sort_by(|a, b| b.0.cmp(&a.0));

    let mut buf = original.to_string();
    for (start, end, replacement) in ranges {
        buf.replace_range(start..end, replacement);
    }
    buf
}

fn lf_to_crlf(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            out.push('\r');
        }
        out.push(c);
    }
    out
}

/// Applies planned edits atomically per file.
pub struct MutationEngine {
    vcs: Arc<dyn LocalVcs>,
    ignore: IgnoreEngine,
    repo_root: PathBuf,
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    impact: Arc<dyn ImpactAnalyzer>,
}

impl MutationEngine {
    pub fn new(vcs: Arc<dyn LocalVcs>, ignore: IgnoreEngine, repo_root: PathBuf) -> Self {
        Self {
            vcs,
            ignore,
            repo_root,
            file_locks: DashMap::new(),
            impact: Arc::new(NoImpactAnalysis),
        }
    }

    pub fn with_impact_analyzer(mut self, analyzer: Arc<dyn ImpactAnalyzer>) -> Self {
        self.impact = analyzer;
        self
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Physically moves a file and, for a clean tracked file, bookkeeps the
    /// move with the VCS driver. For untracked overlay files only the
    /// filesystem move occurs — no VCS call is made. This is the only
    /// rename path the refactor engine uses; it never goes through
    /// `apply()`, since a move has no textual precondition to check.
    pub fn move_file(&self, from: &Path, to: &Path, tracked: bool) -> CoreResult<()> {
        let mut pair = [from.to_path_buf(), to.to_path_buf()];
        pair.sort();
        let _guards: Vec<_> = pair
            .iter()
            .map(|p| self.lock_for(p))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|m| m.lock().unwrap_or_else(|p| p.into_inner()))
            .collect();

        let full_from = self.repo_root.join(from);
        let full_to = self.repo_root.join(to);
        if let Some(parent) = full_to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&full_from, &full_to)?;
        if tracked {
            self.vcs.record_tracked_move(from, to)?;
        }
        info!(from = %from.display(), to = %to.display(), tracked, "file moved");
        Ok(())
    }

    /// Validates that every edit in the batch is within `scope` and not
    /// extended-ignored. Returns the set of paths that are
    /// tracked-ignored-but-overlay (flagged, not rejected).
    fn validate_scope(&self, batch: &EditBatch, scope: &Scope) -> CoreResult<HashSet<PathBuf>> {
        let tracked: HashSet<PathBuf> = self
            .vcs
            .tracked_entries()
            .map(|entries| entries.into_iter().map(|e| e.path).collect())
            .unwrap_or_default();

        let mut flagged = HashSet::new();
        for edit in &batch.edits {
            if !scope.allows(&edit.path) {
                return Err(CoreError::ScopeViolation {
                    path: edit.path.clone(),
                });
            }
            let is_tracked = tracked.contains(&edit.path);
            match self.ignore.classify(&edit.path, is_tracked) {
                Classification::Ignored => {
                    return Err(CoreError::ScopeViolation {
                        path: edit.path.clone(),
                    })
                }
                Classification::Overlay => {
                    flagged.insert(edit.path.clone());
                }
                Classification::Tracked => {}
            }
        }
        Ok(flagged)
    }

    /// Applies `batch` within `scope`, returning a complete structured
    /// delta or an error (precondition mismatch, scope violation).
    pub fn apply(&self, batch: EditBatch, scope: Scope) -> CoreResult<MutationDelta> {
        let repo_before = crate::vcs::current_version(self.vcs.as_ref())?;

        if batch.edits.is_empty() {
            info!("empty edit batch: no-op mutation");
            return Ok(MutationDelta {
                mutation_id: Uuid::new_v4(),
                files: Vec::new(),
                symbols_changed: Vec::new(),
                tests_affected: Vec::new(),
                repo_before: repo_before.clone(),
                repo_after: repo_before,
                not_applied: Vec::new(),
            });
        }

        let flagged = self.validate_scope(&batch, &scope)?;
        if !flagged.is_empty() {
            warn!(count = flagged.len(), "edits touch overlay files; caller confirmation required");
        }

        // Deterministic lexicographic lock order.
        let mut ordered: Vec<&FileEdit> = batch.edits.iter().collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));
        let _guards: Vec<_> = ordered
            .iter()
            .map(|e| self.lock_for(&e.path))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|m| m.lock().unwrap_or_else(|p| p.into_inner()))
            .collect();

        // Stage phase: check preconditions and write temp files for every
        // edit before touching any real target.
        struct Staged {
            path: PathBuf,
            temp_path: PathBuf,
            old_hash: Option<ObjectHash>,
            new_hash: ObjectHash,
            line_ending: LineEnding,
            edits: Vec<TextEdit>,
            lines_added: u32,
            lines_removed: u32,
        }

        let mut staged = Vec::with_capacity(ordered.len());
        for edit in &ordered {
            let full_path = self.repo_root.join(&edit.path);
            let exists = full_path.exists();
            let current_bytes = if exists { fs::read(&full_path)? } else { Vec::new() };

            match &edit.precondition {
                Precondition::Hash(expected) => {
                    let found = content_hash_normalized(&current_bytes);
                    if exists && found != *expected {
                        return Err(CoreError::PreconditionMismatch {
                            path: edit.path.clone(),
                            expected: expected.to_string(),
                            found: found.to_string(),
                        });
                    }
                }
                Precondition::Stat(expected) => {
                    if exists {
                        let found = stat_of(&full_path)?;
                        if found != *expected {
                            return Err(CoreError::PreconditionMismatch {
                                path: edit.path.clone(),
                                expected: format!("{expected:?}"),
                                found: format!("{found:?}"),
                            });
                        }
                    }
                }
            }

            let old_hash = if exists {
                Some(content_hash_normalized(&current_bytes))
            } else {
                None
            };
            let line_ending = detect_line_ending(&current_bytes);
            let original_text = String::from_utf8_lossy(&current_bytes).into_owned();
            let mut new_text = apply_edits(&original_text, &edit.edits);
            if line_ending == LineEnding::CrLf {
                new_text = lf_to_crlf(&new_text.replace("\r\n", "\n"));
            }
            let new_bytes = new_text.into_bytes();
            let new_hash = content_hash_normalized(&new_bytes);
            let (lines_added, lines_removed) = count_line_changes(&original_text, &new_text);

            let parent = full_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| self.repo_root.clone());
            fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::Builder::new()
                .prefix(".repoctl-stage-")
                .tempfile_in(&parent)?;
            tmp.write_all(&new_bytes)?;
            tmp.as_file().sync_all()?;
            let (_, temp_path) = tmp.keep().map_err(|e| CoreError::Io(e.error))?;

            staged.push(Staged {
                path: edit.path.clone(),
                temp_path,
                old_hash,
                new_hash,
                line_ending,
                edits: edit.edits.clone(),
                lines_added,
                lines_removed,
            });
        }

        // Apply phase: atomic replace per file. A failure here partitions
        // applied from not-applied files; already-replaced files stay
        // replaced.
        let mut files = Vec::with_capacity(staged.len());
        let mut not_applied = Vec::new();
        let mut apply_failed = false;
        for s in staged {
            let full_path = self.repo_root.join(&s.path);
            if apply_failed {
                let _ = fs::remove_file(&s.temp_path);
                not_applied.push(s.path);
                continue;
            }
            match fs::rename(&s.temp_path, &full_path) {
                Ok(()) => {
                    if let Ok(f) = fs::File::open(&full_path) {
                        let _ = f.sync_all();
                    }
                    if let Some(parent) = full_path.parent() {
                        if let Ok(dir) = fs::File::open(parent) {
                            let _ = dir.sync_all();
                        }
                    }
                    files.push(FileDelta {
                        path: s.path,
                        old_hash: s.old_hash,
                        new_hash: s.new_hash,
                        line_ending: s.line_ending,
                        edits: s.edits,
                        lines_added: s.lines_added,
                        lines_removed: s.lines_removed,
                    });
                }
                Err(e) => {
                    warn!(path = %s.path.display(), error = %e, "atomic replace failed mid-batch");
                    let _ = fs::remove_file(&s.temp_path);
                    not_applied.push(s.path);
                    apply_failed = true;
                }
            }
        }

        for (from, to) in &batch.renames {
            if let Err(e) = self.vcs.record_tracked_move(from, to) {
                warn!(from = %from.display(), to = %to.display(), error = %e, "tracked-move bookkeeping failed");
            }
        }

        let changed: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        let symbols_changed = self.impact.symbols_changed(&changed);
        let tests_affected = self.impact.tests_affected(&changed);
        let repo_after = crate::vcs::current_version(self.vcs.as_ref())?;

        info!(
            applied = files.len(),
            not_applied = not_applied.len(),
            "mutation applied"
        );

        Ok(MutationDelta {
            mutation_id: Uuid::new_v4(),
            files,
            symbols_changed,
            tests_affected,
            repo_before,
            repo_after,
            not_applied,
        })
    }
}
