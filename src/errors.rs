//! Unified error type for the repository control plane.
//!
//! Every fallible operation in this crate returns `Result<T, CoreError>`. The
//! variants mirror the fault taxonomy the daemon surfaces to external clients:
//! preconditions, scope, VCS metadata, index integrity, parsing, language
//! servers, refactor divergence, budgets, and internal invariants. Convergence
//! stalls are deliberately NOT a variant here — a stalled reconciliation is a
//! signal returned in a result value, not a thrown error (diagnostic logs are
//! a side channel; see `tracing` call sites throughout).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A mutation's stated precondition (expected content hash) no longer
    /// matches the file on disk.
    #[error("precondition mismatch for `{path}`: expected {expected}, found {found}")]
    PreconditionMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// An operation attempted to touch a path outside its declared scope.
    #[error("`{path}` is outside the declared scope")]
    ScopeViolation { path: PathBuf },

    /// The underlying VCS driver failed to report metadata (head, tracked
    /// set, submodule state) the reconciliation engine needed.
    #[error("vcs metadata fault: {0}")]
    VcsMetadataFault(String),

    /// The on-disk lexical or structural index failed an integrity check and
    /// must be rebuilt.
    #[error("index corruption detected: {0}")]
    IndexCorruption(String),

    /// A source file could not be parsed into chunks/symbols.
    #[error("parse failure in `{path}`: {reason}")]
    ParseFailure { path: PathBuf, reason: String },

    /// The language server failed to answer a request (crash, timeout,
    /// malformed response).
    #[error("language server fault: {0}")]
    LanguageServerFault(String),

    /// Two or more refactor contexts produced overlapping, non-identical
    /// edits to the same file and could not be merged.
    #[error("refactor divergence on `{path}`: {reason}")]
    RefactorDivergence { path: PathBuf, reason: String },

    /// A task exhausted its declared budget (time, tool calls, or mutation
    /// count) before converging.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    /// An internal invariant that should be unreachable was violated; this
    /// always indicates a bug in the core rather than bad external input.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("{0}")]
    Custom(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
