//! `repoctl-core`: a repository control plane for external AI coding
//! clients — deterministic reconciliation, a hybrid lexical/structural/
//! graph index, atomic scoped mutation, multi-context semantic refactors,
//! cost-balanced cross-language test scheduling, and an append-only task
//! ledger.
//!
//! This crate is the core only: it does not plan,
//! choose strategies, retry on behalf of clients, or decide success or
//! failure. Concrete version-control drivers, language-server transports,
//! test-runner adapters, and the operator command-line surface are external
//! collaborators; this crate defines the traits they implement.

pub mod actor;
pub mod config;
pub mod diff;
pub mod errors;
pub mod hash;
pub mod ignore;
pub mod index;
pub mod integrity;
pub mod ledger;
pub mod mutation;
pub mod reconcile;
pub mod refactor;
pub mod retrieval;
pub mod scheduler;
pub mod utils;
pub mod vcs;
