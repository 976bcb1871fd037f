//! Version-control integration: the two capabilities the core consumes from
//! an external driver and the `RepoVersion` identity they produce.
//!
//! Only trait-level interfaces live here. No concrete driver (git,
//! mercurial, or otherwise) is implemented in core — that is deliberately an
//! external collaborator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;
use crate::hash::ObjectHash;
use crate::integrity::{compute_integrity_hash, IntegrityHash};

/// Stat metadata cheap enough to compare on every reconciliation pass
/// before falling back to content hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatMeta {
    pub mtime_nanos: i64,
    pub size: u64,
    pub inode: u64,
}

/// One tracked entry as reported by the local VCS driver: a path, its blob
/// hash at the tracked revision, and the stat tuple to compare cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntry {
    pub path: PathBuf,
    pub blob_hash: ObjectHash,
    pub stat: StatMeta,
}

/// The canonical tuple identifying repository state.
/// Opaque, total-order-per-step identity: two values are compared only for
/// equality, never ordered or interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoVersion {
    pub head_id: String,
    pub staged_index_stat: StatMeta,
    pub submodule_heads: Vec<(PathBuf, String)>,
}

impl RepoVersion {
    /// Sealed content-addressed snapshot of this version, used to detect a
    /// true no-op reconciliation.
    pub fn seal(&self) -> IntegrityHash {
        compute_integrity_hash(self).expect("RepoVersion always serializes")
    }
}

/// Local, synchronous, non-mutating operations the reconciliation and
/// mutation engines depend on. Implementations must not spawn shell
/// subprocesses and must not mutate state other than the one permitted
/// tracked-move bookkeeping call.
pub trait LocalVcs: Send + Sync {
    /// Identity of the current head (commit/changeset id or equivalent).
    fn head_id(&self) -> CoreResult<String>;

    /// Stat metadata of the staged-index file (or equivalent native index).
    fn staged_index_stat(&self) -> CoreResult<StatMeta>;

    /// All tracked entries with their recorded blob hash and stat tuple.
    fn tracked_entries(&self) -> CoreResult<Vec<TrackedEntry>>;

    /// Head identity of each initialized submodule, recursively.
    fn submodule_heads(&self) -> CoreResult<Vec<(PathBuf, String)>>;

    /// Walk untracked entries under `root`, honoring the driver's own
    /// tracked-ignore layer (the extended-ignore layer is applied by the
    /// ignore engine on top of this).
    fn walk_untracked(&self, root: &Path) -> CoreResult<Vec<PathBuf>>;

    /// Diff between working tree and head for `path`, if needed by a
    /// caller; returns `None` when the path is unchanged.
    fn diff_against_head(&self, path: &Path) -> CoreResult<Option<String>>;

    /// The only permitted mutation: record that a tracked, clean file moved
    /// from `from` to `to` (index bookkeeping only, no commit).
    fn record_tracked_move(&self, from: &Path, to: &Path) -> CoreResult<()>;
}

/// Remote, network-bound operations. Subprocess-spawned implementations are
/// expected (to inherit credential configuration); invoked only by explicit
/// client operations, never autonomously.
#[async_trait]
pub trait RemoteVcs: Send + Sync {
    async fn fetch(&self, remote: &str) -> CoreResult<()>;
    async fn pull(&self, remote: &str, branch: &str) -> CoreResult<()>;
    async fn push(&self, remote: &str, branch: &str) -> CoreResult<()>;
}

/// Computes `current_version()` from a `LocalVcs` driver.
pub fn current_version(vcs: &dyn LocalVcs) -> CoreResult<RepoVersion> {
    Ok(RepoVersion {
        head_id: vcs.head_id()?,
        staged_index_stat: vcs.staged_index_stat()?,
        submodule_heads: vcs.submodule_heads()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_version(head: &str) -> RepoVersion {
        RepoVersion {
            head_id: head.to_string(),
            staged_index_stat: StatMeta {
                mtime_nanos: 1,
                size: 2,
                inode: 3,
            },
            submodule_heads: vec![],
        }
    }

    #[test]
    fn seal_is_deterministic_and_sensitive_to_head() {
        let a = sample_version("abc");
        let b = sample_version("abc");
        let c = sample_version("def");
        assert_eq!(a.seal(), b.seal());
        assert_ne!(a.seal(), c.seal());
    }
}
