//! Refactor engine: semantic refactors delegated to language
//! servers, executed in sandboxed per-context worktrees, merged across
//! contexts when more than one applies, and committed atomically to the
//! real working tree via the mutation engine.
//!
//! The core never guesses symbol bindings to drive a semantic refactor —
//! it only consumes the [`LanguageServerClient`] trait below and merges
//! whatever patches come back. A non-semantic sweep for comments,
//! docstrings, and documentation is always generated as a separate,
//! optional patch set — it is never merged with the semantic patch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::hash::ObjectHash;
use crate::mutation::{
    apply_edits, line_col_to_offset, EditBatch, EditRange, FileEdit, LineCol, MutationDelta,
    MutationEngine, Precondition, Scope, TextEdit,
};
use crate::reconcile::content_hash_normalized;
use crate::vcs::LocalVcs;

/// A semantic world within which a language server can resolve a subset of
/// the repository. The environment selector captures whatever the server
/// needs to resolve symbols — interpreter path, solution/project file,
/// module/work root, build tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub context_id: String,
    pub language: String,
    pub server_identity: String,
    pub server_version: String,
    pub environment_selector: BTreeMap<String, String>,
    pub workspace_roots: Vec<PathBuf>,
    /// Paths this context's sandbox worktree is sparse-checked out to.
    pub sparse_checkout_paths: Vec<PathBuf>,
}

/// The refactor operations a language server may be asked to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefactorKind {
    RenameSymbol {
        symbol_id: String,
        new_name: String,
    },
    RenameOrMoveFile {
        from: PathBuf,
        to: PathBuf,
    },
    SafeDeleteSymbol {
        symbol_id: String,
    },
    ChangeSignature {
        symbol_id: String,
        new_signature: String,
    },
}

/// A workspace-wide edit a language server hands back, keyed by the
/// (context-relative) path it touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceEdit {
    pub file_edits: BTreeMap<PathBuf, Vec<TextEdit>>,
}

/// The consumed language-server capability interface: line-delimited
/// structured RPC over subprocess stdio, one session per context. No
/// concrete server process management beyond spawning and a per-request
/// timeout belongs in core — that transport is an external collaborator.
#[async_trait]
pub trait LanguageServerClient: Send + Sync {
    /// Pushes in-memory content for `path`; language servers never read
    /// from disk directly.
    async fn open_document(&self, path: &Path, content: &str) -> CoreResult<()>;
    async fn close_document(&self, path: &Path) -> CoreResult<()>;
    /// Whether a rename is valid at `position`.
    async fn prepare_rename(&self, path: &Path, position: LineCol) -> CoreResult<bool>;
    async fn rename(
        &self,
        path: &Path,
        position: LineCol,
        new_name: &str,
    ) -> CoreResult<WorkspaceEdit>;
    /// `None` when the server doesn't support safe-delete for this symbol
    /// kind.
    async fn safe_delete(&self, path: &Path, position: LineCol) -> CoreResult<Option<WorkspaceEdit>>;
    async fn change_signature(
        &self,
        path: &Path,
        position: LineCol,
        new_signature: &str,
    ) -> CoreResult<Option<WorkspaceEdit>>;
    async fn diagnostics(&self, path: &Path) -> CoreResult<Vec<String>>;
}

/// One file's state after a context's sandbox run: full new content plus a
/// unified diff for display and cross-context comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: PathBuf,
    pub old_hash: Option<ObjectHash>,
    pub new_content: String,
    pub unified_diff: String,
}

/// A complete set of per-file changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    pub files: Vec<FilePatch>,
}

/// One path where two or more contexts produced non-identical edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergentHunk {
    pub path: PathBuf,
    pub context_ids: Vec<String>,
    /// Each involved context's rendering of the file, in `context_ids` order.
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub hunks: Vec<DivergentHunk>,
    pub diagnostics: BTreeMap<String, Vec<String>>,
}

/// Default is fail-and-report; the deterministic
/// override is available but off by default — the engine never silently
/// chooses a semantic interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergencePolicy {
    FailAndReport,
    /// Accepted only if validation (diagnostics) passes in every context.
    PrimaryContextWins,
}

impl Default for DivergencePolicy {
    fn default() -> Self {
        Self::FailAndReport
    }
}

/// Created by plan, survives until apply or cancel, discarded after apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorPlan {
    pub plan_id: Uuid,
    pub operation_kind: RefactorKind,
    pub contexts: Vec<String>,
    pub per_context_patch: BTreeMap<String, Patch>,
    pub merged_patch: Option<Patch>,
    pub divergence_report: Option<DivergenceReport>,
}

/// The outcome of a refactor attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefactorResult {
    Applied {
        patch: Patch,
        contexts_used: Vec<String>,
        validation: BTreeMap<String, Vec<String>>,
    },
    Divergence {
        report: DivergenceReport,
    },
    InsufficientContext {
        reason: String,
    },
}

/// A separate, preview-able, never-merged patch for exact-string
/// substitution within comment/docstring spans and documentation files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonSemanticSweep {
    pub patch: Patch,
}

fn unified_diff_text(path: &Path, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&format!("a/{}", path.display()), &format!("b/{}", path.display()))
        .to_string()
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> CoreResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A sibling checkout sandboxing one context's refactor attempt. Built by copying the context's
/// sparse paths out of the real, already-reconciled working tree — the
/// stand-in for "reset to current head" in a core that doesn't own a
/// concrete VCS driver.
struct Worktree {
    dir: TempDir,
}

impl Worktree {
    fn create(repo_root: &Path, ctx: &Context) -> CoreResult<Self> {
        let dir = TempDir::new()?;
        for rel in &ctx.sparse_checkout_paths {
            let src = repo_root.join(rel);
            let dst = dir.path().join(rel);
            if src.is_dir() {
                copy_dir_recursive(&src, &dst)?;
            } else if src.is_file() {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&src, &dst)?;
            }
        }
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Drives the plan→preview→apply lifecycle across one or more contexts and
/// applies the result to the real working tree via a [`MutationEngine`].
pub struct RefactorEngine {
    repo_root: PathBuf,
    #[allow(dead_code)]
    vcs: Arc<dyn LocalVcs>,
    mutation: Arc<MutationEngine>,
    divergence_policy: DivergencePolicy,
    max_parallel_contexts: usize,
}

impl RefactorEngine {
    pub fn new(vcs: Arc<dyn LocalVcs>, mutation: Arc<MutationEngine>, repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            vcs,
            mutation,
            divergence_policy: DivergencePolicy::default(),
            max_parallel_contexts: 4,
        }
    }

    pub fn with_divergence_policy(mut self, policy: DivergencePolicy) -> Self {
        self.divergence_policy = policy;
        self
    }

    pub fn with_max_parallel_contexts(mut self, n: usize) -> Self {
        self.max_parallel_contexts = n.max(1);
        self
    }

    /// Selects the context owning the definition file, plus contexts
    /// indexed as containing known dependents; if ambiguous, every context
    /// for the language, up to the parallelism cap — never a heuristic
    /// guess.
    fn select_contexts<'a>(
        &self,
        language: &str,
        available: &'a [Context],
        owning_context_id: Option<&str>,
        dependent_context_ids: &[String],
    ) -> Vec<&'a Context> {
        let mut selected: Vec<&Context> = Vec::new();
        if let Some(owner) = owning_context_id {
            if let Some(c) = available.iter().find(|c| c.context_id == owner) {
                selected.push(c);
            }
        }
        for id in dependent_context_ids {
            if let Some(c) = available.iter().find(|c| &c.context_id == id) {
                if !selected.iter().any(|s| s.context_id == c.context_id) {
                    selected.push(c);
                }
            }
        }
        if selected.is_empty() {
            selected = available.iter().filter(|c| c.language == language).collect();
            if selected.len() > self.max_parallel_contexts {
                warn!(
                    language,
                    available = selected.len(),
                    cap = self.max_parallel_contexts,
                    "ambiguous context selection truncated to parallelism cap"
                );
                selected.truncate(self.max_parallel_contexts);
            }
        }
        selected
    }

    /// Resets (the worktree is already a fresh head copy), asks the
    /// server, applies in the sandbox, and derives a unified patch.
    /// Applying to the real tree happens once, after merging, in
    /// [`Self::apply`].
    async fn single_context_flow(
        &self,
        ctx: &Context,
        client: &dyn LanguageServerClient,
        kind: &RefactorKind,
        position: Option<LineCol>,
    ) -> CoreResult<Patch> {
        let worktree = Worktree::create(&self.repo_root, ctx)?;

        let workspace_edit = match kind {
            RefactorKind::RenameSymbol { new_name, .. } => {
                let position = position.ok_or_else(|| {
                    CoreError::LanguageServerFault("rename requires a source position".into())
                })?;
                // The defining file is whichever sparse path the caller
                // lists first; a real orchestrator resolves this from the
                // structural store's defining_chunk_id.
                let file = ctx
                    .sparse_checkout_paths
                    .first()
                    .ok_or_else(|| CoreError::LanguageServerFault("context has no paths".into()))?;
                let sandbox_path = worktree.path().join(file);
                let content = fs::read_to_string(&sandbox_path).unwrap_or_default();
                client.open_document(&sandbox_path, &content).await?;
                if !client.prepare_rename(&sandbox_path, position).await? {
                    return Err(CoreError::LanguageServerFault(format!(
                        "rename not valid at {:?} in context {}",
                        position, ctx.context_id
                    )));
                }
                let edit = client.rename(&sandbox_path, position, new_name).await?;
                client.close_document(&sandbox_path).await?;
                edit
            }
            RefactorKind::SafeDeleteSymbol { .. } => {
                let file = ctx
                    .sparse_checkout_paths
                    .first()
                    .ok_or_else(|| CoreError::LanguageServerFault("context has no paths".into()))?;
                let sandbox_path = worktree.path().join(file);
                let position = position.ok_or_else(|| {
                    CoreError::LanguageServerFault("safe-delete requires a source position".into())
                })?;
                client
                    .safe_delete(&sandbox_path, position)
                    .await?
                    .ok_or_else(|| {
                        CoreError::LanguageServerFault(format!(
                            "safe-delete unsupported in context {}",
                            ctx.context_id
                        ))
                    })?
            }
            RefactorKind::ChangeSignature { new_signature, .. } => {
                let file = ctx
                    .sparse_checkout_paths
                    .first()
                    .ok_or_else(|| CoreError::LanguageServerFault("context has no paths".into()))?;
                let sandbox_path = worktree.path().join(file);
                let position = position.ok_or_else(|| {
                    CoreError::LanguageServerFault("change-signature requires a source position".into())
                })?;
                client
                    .change_signature(&sandbox_path, position, new_signature)
                    .await?
                    .ok_or_else(|| {
                        CoreError::LanguageServerFault(format!(
                            "change-signature unsupported in context {}",
                            ctx.context_id
                        ))
                    })?
            }
            RefactorKind::RenameOrMoveFile { .. } => {
                // File moves don't route through a language server; handled
                // directly by the mutation engine in `apply_file_move`.
                return Ok(Patch::default());
            }
        };

        let mut files = Vec::with_capacity(workspace_edit.file_edits.len());
        for (rel_path, edits) in &workspace_edit.file_edits {
            let sandbox_path = worktree.path().join(rel_path);
            let original = fs::read_to_string(&sandbox_path).unwrap_or_default();
            let new_content = apply_edits(&original, edits);
            fs::write(&sandbox_path, &new_content)?;

            let real_path = self.repo_root.join(rel_path);
            let old_hash = fs::read(&real_path).ok().map(|b| content_hash_normalized(&b));
            let unified_diff = unified_diff_text(rel_path, &original, &new_content);
            files.push(FilePatch {
                path: rel_path.clone(),
                old_hash,
                new_content,
                unified_diff,
            });
        }
        Ok(Patch { files })
    }

    /// Runs the single-context flow through each selected context's
    /// sandbox concurrently, then merges the resulting patches.
    pub async fn plan(
        &self,
        kind: RefactorKind,
        language: &str,
        available_contexts: &[Context],
        clients: &BTreeMap<String, Arc<dyn LanguageServerClient>>,
        position: Option<LineCol>,
        owning_context_id: Option<&str>,
        dependent_context_ids: &[String],
    ) -> CoreResult<RefactorPlan> {
        let contexts = self.select_contexts(language, available_contexts, owning_context_id, dependent_context_ids);
        if contexts.is_empty() {
            return Ok(RefactorPlan {
                plan_id: Uuid::new_v4(),
                operation_kind: kind,
                contexts: Vec::new(),
                per_context_patch: BTreeMap::new(),
                merged_patch: None,
                divergence_report: None,
            });
        }

        let mut futures = Vec::with_capacity(contexts.len());
        for ctx in &contexts {
            let ctx = (*ctx).clone();
            let kind = kind.clone();
            let client = clients.get(&ctx.context_id).cloned().ok_or_else(|| {
                CoreError::LanguageServerFault(format!("no client bound for context {}", ctx.context_id))
            })?;
            futures.push(async move {
                let patch = self.single_context_flow(&ctx, client.as_ref(), &kind, position).await?;
                CoreResult::Ok((ctx.context_id, patch))
            });
        }
        let results = try_join_all(futures).await?;
        let per_context_patch: BTreeMap<String, Patch> = results.into_iter().collect();

        let (merged, divergence) = self.merge_patches(&per_context_patch, clients).await;
        info!(
            contexts = per_context_patch.len(),
            divergent = divergence.is_some(),
            "refactor plan computed"
        );

        Ok(RefactorPlan {
            plan_id: Uuid::new_v4(),
            operation_kind: kind,
            contexts: per_context_patch.keys().cloned().collect(),
            per_context_patch,
            merged_patch: merged,
            divergence_report: divergence,
        })
    }

    /// multi-context step 3: disjoint hunks unioned, byte-identical
    /// overlaps deduplicated, non-identical overlaps diverge. A "hunk" here
    /// is whole-file granularity — the per-context patch for a path either
    /// agrees or it doesn't; finer hunk-level merging belongs to whatever
    /// parser produces chunk-level patches and is not reimplemented here.
    async fn merge_patches(
        &self,
        per_context: &BTreeMap<String, Patch>,
        clients: &BTreeMap<String, Arc<dyn LanguageServerClient>>,
    ) -> (Option<Patch>, Option<DivergenceReport>) {
        let mut by_path: BTreeMap<PathBuf, Vec<(&str, &FilePatch)>> = BTreeMap::new();
        for (ctx_id, patch) in per_context {
            for fp in &patch.files {
                by_path.entry(fp.path.clone()).or_default().push((ctx_id.as_str(), fp));
            }
        }

        let mut merged_files = Vec::new();
        let mut divergent = Vec::new();
        let mut diagnostics: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, variants) in by_path {
            let first = variants[0].1;
            let agrees = variants.iter().all(|(_, fp)| fp.new_content == first.new_content);
            if agrees {
                merged_files.push(first.clone());
                continue;
            }
            if self.divergence_policy == DivergencePolicy::PrimaryContextWins {
                let mut all_valid = true;
                for (ctx_id, _) in &variants {
                    let Some(client) = clients.get(*ctx_id) else {
                        all_valid = false;
                        continue;
                    };
                    match client.diagnostics(&path).await {
                        Ok(found) if found.is_empty() => {}
                        Ok(found) => {
                            all_valid = false;
                            diagnostics.entry(ctx_id.to_string()).or_default().extend(found);
                        }
                        Err(e) => {
                            all_valid = false;
                            diagnostics
                                .entry(ctx_id.to_string())
                                .or_default()
                                .push(e.to_string());
                        }
                    }
                }
                if all_valid {
                    merged_files.push(first.clone());
                    continue;
                }
            }
            divergent.push(DivergentHunk {
                path,
                context_ids: variants.iter().map(|(c, _)| c.to_string()).collect(),
                variants: variants.iter().map(|(_, fp)| fp.unified_diff.clone()).collect(),
            });
        }

        if divergent.is_empty() {
            (Some(Patch { files: merged_files }), None)
        } else {
            (
                None,
                Some(DivergenceReport {
                    hunks: divergent,
                    diagnostics,
                }),
            )
        }
    }

    /// step 5: applies the plan's merged patch once, atomically, to
    /// the real working tree via the mutation engine. Resolves the plan's
    /// outcome into the result taxonomy.
    pub fn apply(&self, plan: &RefactorPlan) -> CoreResult<RefactorResult> {
        if let Some(report) = &plan.divergence_report {
            return Ok(RefactorResult::Divergence {
                report: report.clone(),
            });
        }
        let Some(patch) = &plan.merged_patch else {
            return Ok(RefactorResult::InsufficientContext {
                reason: "no context produced a patch".to_string(),
            });
        };
        if patch.files.is_empty() {
            return Ok(RefactorResult::Applied {
                patch: patch.clone(),
                contexts_used: plan.contexts.clone(),
                validation: BTreeMap::new(),
            });
        }

        let mut edits = Vec::with_capacity(patch.files.len());
        for fp in &patch.files {
            let precondition = match fp.old_hash {
                Some(h) => Precondition::Hash(h),
                None => Precondition::Hash(content_hash_normalized(b"")),
            };
            edits.push(FileEdit {
                path: fp.path.clone(),
                precondition,
                edits: vec![TextEdit {
                    range: EditRange {
                        start: LineCol { line: 1, col: 0 },
                        end: LineCol {
                            line: u32::MAX,
                            col: 0,
                        },
                    },
                    replacement: fp.new_content.clone(),
                    semantic_symbol_id: None,
                }],
            });
        }
        let scope = Scope {
            allowed: patch.files.iter().map(|f| f.path.clone()).collect(),
        };
        self.mutation.apply(EditBatch { edits, renames: Vec::new() }, scope)?;

        Ok(RefactorResult::Applied {
            patch: patch.clone(),
            contexts_used: plan.contexts.clone(),
            validation: BTreeMap::new(),
        })
    }

    /// Handles `RefactorKind::RenameOrMoveFile` directly: no language
    /// server is consulted for the move itself.
    pub fn apply_file_move(&self, from: &Path, to: &Path, tracked: bool) -> CoreResult<()> {
        self.mutation.move_file(from, to, tracked)
    }

    /// Exact-string substitution within already-identified comment/
    /// docstring spans and whole documentation files. Always returned
    /// separately; callers decide whether and when to apply it via the
    /// mutation engine — this function never calls `apply()` itself.
    pub fn non_semantic_sweep(
        &self,
        comment_spans: &BTreeMap<PathBuf, Vec<EditRange>>,
        doc_file_paths: &[PathBuf],
        old_text: &str,
        new_text: &str,
    ) -> CoreResult<NonSemanticSweep> {
        let mut files = Vec::new();

        for (path, spans) in comment_spans {
            let full = self.repo_root.join(path);
            let Ok(content) = fs::read_to_string(&full) else {
                continue;
            };
            let mut edits = Vec::new();
            for span in spans {
                let start = line_col_to_offset(&content, span.start);
                let end = line_col_to_offset(&content, span.end);
                let (lo, hi) = (start.min(end), start.max(end));
                let slice = &content[lo..hi];
                if slice.contains(old_text) {
                    edits.push(TextEdit {
                        range: *span,
                        replacement: slice.replace(old_text, new_text),
                        semantic_symbol_id: None,
                    });
                }
            }
            if edits.is_empty() {
                continue;
            }
            let new_content = apply_edits(&content, &edits);
            files.push(FilePatch {
                path: path.clone(),
                old_hash: Some(content_hash_normalized(content.as_bytes())),
                unified_diff: unified_diff_text(path, &content, &new_content),
                new_content,
            });
        }

        for path in doc_file_paths {
            let full = self.repo_root.join(path);
            let Ok(content) = fs::read_to_string(&full) else {
                continue;
            };
            if !content.contains(old_text) {
                continue;
            }
            let new_content = content.replace(old_text, new_text);
            files.push(FilePatch {
                path: path.clone(),
                old_hash: Some(content_hash_normalized(content.as_bytes())),
                unified_diff: unified_diff_text(path, &content, &new_content),
                new_content,
            });
        }

        Ok(NonSemanticSweep {
            patch: Patch { files },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::ignore::IgnoreEngine;
    use crate::vcs::StatMeta;

    struct FakeVcs {
        head: StdMutex<String>,
    }
    impl LocalVcs for FakeVcs {
        fn head_id(&self) -> CoreResult<String> {
            Ok(self.head.lock().unwrap().clone())
        }
        fn staged_index_stat(&self) -> CoreResult<StatMeta> {
            Ok(StatMeta { mtime_nanos: 0, size: 0, inode: 0 })
        }
        fn tracked_entries(&self) -> CoreResult<Vec<crate::vcs::TrackedEntry>> {
            Ok(Vec::new())
        }
        fn submodule_heads(&self) -> CoreResult<Vec<(PathBuf, String)>> {
            Ok(Vec::new())
        }
        fn walk_untracked(&self, _root: &Path) -> CoreResult<Vec<PathBuf>> {
            Ok(Vec::new())
        }
        fn diff_against_head(&self, _path: &Path) -> CoreResult<Option<String>> {
            Ok(None)
        }
        fn record_tracked_move(&self, _from: &Path, _to: &Path) -> CoreResult<()> {
            Ok(())
        }
    }

    struct StubClient {
        edit: WorkspaceEdit,
        diagnostics: Vec<String>,
    }

    #[async_trait]
    impl LanguageServerClient for StubClient {
        async fn open_document(&self, _path: &Path, _content: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn close_document(&self, _path: &Path) -> CoreResult<()> {
            Ok(())
        }
        async fn prepare_rename(&self, _path: &Path, _position: LineCol) -> CoreResult<bool> {
            Ok(true)
        }
        async fn rename(
            &self,
            _path: &Path,
            _position: LineCol,
            _new_name: &str,
        ) -> CoreResult<WorkspaceEdit> {
            Ok(self.edit.clone())
        }
        async fn safe_delete(&self, _path: &Path, _position: LineCol) -> CoreResult<Option<WorkspaceEdit>> {
            Ok(None)
        }
        async fn change_signature(
            &self,
            _path: &Path,
            _position: LineCol,
            _new_signature: &str,
        ) -> CoreResult<Option<WorkspaceEdit>> {
            Ok(None)
        }
        async fn diagnostics(&self, _path: &Path) -> CoreResult<Vec<String>> {
            Ok(self.diagnostics.clone())
        }
    }

    fn engine(root: &Path) -> RefactorEngine {
        let vcs = Arc::new(FakeVcs { head: StdMutex::new("h1".into()) });
        let mutation = Arc::new(MutationEngine::new(vcs.clone(), IgnoreEngine::new(&[], &[]), root.to_path_buf()));
        RefactorEngine::new(vcs, mutation, root.to_path_buf())
    }

    fn rename_edit(path: &str, replacement: &str) -> WorkspaceEdit {
        let mut file_edits = BTreeMap::new();
        file_edits.insert(
            PathBuf::from(path),
            vec![TextEdit {
                range: EditRange {
                    start: LineCol { line: 1, col: 6 },
                    end: LineCol { line: 1, col: 11 },
                },
                replacement: replacement.to_string(),
                semantic_symbol_id: Some("Alpha".to_string()),
            }],
        );
        WorkspaceEdit { file_edits }
    }

    #[tokio::test]
    async fn single_context_rename_applies_without_divergence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn Alpha() {}\n").unwrap();
        let engine = engine(dir.path());

        let ctx = Context {
            context_id: "ctx-a".into(),
            language: "rust".into(),
            server_identity: "rust-analyzer".into(),
            server_version: "1.0".into(),
            environment_selector: BTreeMap::new(),
            workspace_roots: vec![PathBuf::new()],
            sparse_checkout_paths: vec![PathBuf::from("a.rs")],
        };
        let mut clients: BTreeMap<String, Arc<dyn LanguageServerClient>> = BTreeMap::new();
        clients.insert(
            "ctx-a".into(),
            Arc::new(StubClient { edit: rename_edit("a.rs", "Beta"), diagnostics: Vec::new() }),
        );

        let plan = engine
            .plan(
                RefactorKind::RenameSymbol { symbol_id: "Alpha".into(), new_name: "Beta".into() },
                "rust",
                std::slice::from_ref(&ctx),
                &clients,
                Some(LineCol { line: 1, col: 6 }),
                None,
                &[],
            )
            .await
            .unwrap();

        assert!(plan.divergence_report.is_none());
        let result = engine.apply(&plan).unwrap();
        match result {
            RefactorResult::Applied { patch, .. } => {
                assert_eq!(patch.files.len(), 1);
                assert_eq!(patch.files[0].new_content, "fn Beta() {}\n");
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(dir.path().join("a.rs")).unwrap(), "fn Beta() {}\n");
    }

    #[tokio::test]
    async fn conflicting_contexts_report_divergence_without_touching_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn Alpha() {}\n").unwrap();
        let engine = engine(dir.path());

        let ctx_a = Context {
            context_id: "ctx-a".into(),
            language: "rust".into(),
            server_identity: "ls-a".into(),
            server_version: "1.0".into(),
            environment_selector: BTreeMap::new(),
            workspace_roots: vec![PathBuf::new()],
            sparse_checkout_paths: vec![PathBuf::from("a.rs")],
        };
        let ctx_b = Context {
            context_id: "ctx-b".into(),
            ..clone_ctx(&ctx_a)
        };

        let mut clients: BTreeMap<String, Arc<dyn LanguageServerClient>> = BTreeMap::new();
        clients.insert("ctx-a".into(), Arc::new(StubClient { edit: rename_edit("a.rs", "Beta"), diagnostics: Vec::new() }));
        clients.insert("ctx-b".into(), Arc::new(StubClient { edit: rename_edit("a.rs", "Gamma"), diagnostics: Vec::new() }));

        let plan = engine
            .plan(
                RefactorKind::RenameSymbol { symbol_id: "Alpha".into(), new_name: "Beta".into() },
                "rust",
                &[ctx_a, ctx_b],
                &clients,
                Some(LineCol { line: 1, col: 6 }),
                None,
                &[],
            )
            .await
            .unwrap();

        assert!(plan.merged_patch.is_none());
        let result = engine.apply(&plan).unwrap();
        assert!(matches!(result, RefactorResult::Divergence { .. }));
        assert_eq!(fs::read_to_string(dir.path().join("a.rs")).unwrap(), "fn Alpha() {}\n");
    }

    #[tokio::test]
    async fn primary_context_wins_accepts_only_when_all_contexts_validate_clean() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn Alpha() {}\n").unwrap();
        let engine = engine(dir.path()).with_divergence_policy(DivergencePolicy::PrimaryContextWins);

        let ctx_a = Context {
            context_id: "ctx-a".into(),
            language: "rust".into(),
            server_identity: "ls-a".into(),
            server_version: "1.0".into(),
            environment_selector: BTreeMap::new(),
            workspace_roots: vec![PathBuf::new()],
            sparse_checkout_paths: vec![PathBuf::from("a.rs")],
        };
        let ctx_b = Context {
            context_id: "ctx-b".into(),
            ..clone_ctx(&ctx_a)
        };

        let mut clients: BTreeMap<String, Arc<dyn LanguageServerClient>> = BTreeMap::new();
        clients.insert(
            "ctx-a".into(),
            Arc::new(StubClient { edit: rename_edit("a.rs", "Beta"), diagnostics: Vec::new() }),
        );
        clients.insert(
            "ctx-b".into(),
            Arc::new(StubClient { edit: rename_edit("a.rs", "Gamma"), diagnostics: vec!["unresolved reference".into()] }),
        );

        let plan = engine
            .plan(
                RefactorKind::RenameSymbol { symbol_id: "Alpha".into(), new_name: "Beta".into() },
                "rust",
                &[ctx_a.clone(), ctx_b.clone()],
                &clients,
                Some(LineCol { line: 1, col: 6 }),
                None,
                &[],
            )
            .await
            .unwrap();

        // ctx-b fails validation, so even under PrimaryContextWins the
        // divergence is reported rather than silently accepting ctx-a.
        assert!(plan.merged_patch.is_none());
        assert!(plan.divergence_report.is_some());

        clients.insert(
            "ctx-b".into(),
            Arc::new(StubClient { edit: rename_edit("a.rs", "Gamma"), diagnostics: Vec::new() }),
        );
        let clean_plan = engine
            .plan(
                RefactorKind::RenameSymbol { symbol_id: "Alpha".into(), new_name: "Beta".into() },
                "rust",
                &[ctx_a, ctx_b],
                &clients,
                Some(LineCol { line: 1, col: 6 }),
                None,
                &[],
            )
            .await
            .unwrap();

        // Both contexts validate clean, so the primary context's variant is accepted.
        assert!(clean_plan.divergence_report.is_none());
        let merged = clean_plan.merged_patch.unwrap();
        assert_eq!(merged.files[0].new_content, "fn Beta() {}\n");
    }

    fn clone_ctx(ctx: &Context) -> Context {
        Context {
            context_id: ctx.context_id.clone(),
            language: ctx.language.clone(),
            server_identity: ctx.server_identity.clone(),
            server_version: ctx.server_version.clone(),
            environment_selector: ctx.environment_selector.clone(),
            workspace_roots: ctx.workspace_roots.clone(),
            sparse_checkout_paths: ctx.sparse_checkout_paths.clone(),
        }
    }

    #[test]
    fn non_semantic_sweep_never_touches_real_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "See Alpha for details.\n").unwrap();
        let engine = engine(dir.path());

        let sweep = engine
            .non_semantic_sweep(&BTreeMap::new(), &[PathBuf::from("README.md")], "Alpha", "Beta")
            .unwrap();

        assert_eq!(sweep.patch.files.len(), 1);
        assert_eq!(sweep.patch.files[0].new_content, "See Beta for details.\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "See Alpha for details.\n"
        );
    }
}
