//! Daemon configuration. This crate only defines the typed target; parsing
//! `config.toml` into it is an operator-surface concern and stays out of
//! scope.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Graph traversal depth/fanout caps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCaps {
    pub default_depth: u32,
    pub max_depth: u32,
    pub utility_fanout: usize,
    pub class_fanout: usize,
}

impl Default for GraphCaps {
    fn default() -> Self {
        Self {
            default_depth: 2,
            max_depth: 3,
            utility_fanout: 3,
            class_fanout: 10,
        }
    }
}

/// Test scheduler defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub per_target_timeout_secs: u64,
    /// Wall-clock budget for an entire `run()` call, across all bins. Once
    /// exceeded, no further targets are started; already-running ones are
    /// still classified by their own per-target timeout.
    pub run_timeout_secs: u64,
    pub max_workers: usize,
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            per_target_timeout_secs: 30,
            run_timeout_secs: 1800,
            max_workers: num_cpus::get().min(8),
            fail_fast: false,
        }
    }
}

/// Ledger retention policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_age_days: u32,
    pub max_tasks: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 14,
            max_tasks: 500,
        }
    }
}

/// Hybrid-index tuning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    pub index_docstrings: bool,
    pub segment_merge_deleted_ratio_pct: u8,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_docstrings: false,
            segment_merge_deleted_ratio_pct: 30,
        }
    }
}

/// Refactor engine tuning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefactorConfig {
    pub max_contexts_per_language: usize,
    pub deterministic_override: bool,
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            max_contexts_per_language: 4,
            deterministic_override: false,
        }
    }
}

/// Root configuration object, loaded from the daemon-owned directory's
/// `config.toml`. Parsing that file is out of scope; this struct is the
/// typed target such a loader would populate, with every field defaulted
/// to the values stated above.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Directory the daemon owns within the repository root (indexes,
    /// ledger, extended-ignore file, transport socket).
    pub state_dir: PathBuf,
    pub graph: GraphCaps,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub index: IndexConfig,
    pub refactor: RefactorConfig,
    pub mutation_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".repoctl"),
            graph: GraphCaps::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionConfig::default(),
            index: IndexConfig::default(),
            refactor: RefactorConfig::default(),
            mutation_workers: num_cpus::get().min(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.graph.default_depth, 2);
        assert_eq!(cfg.graph.max_depth, 3);
        assert_eq!(cfg.graph.utility_fanout, 3);
        assert_eq!(cfg.graph.class_fanout, 10);
        assert_eq!(cfg.scheduler.per_target_timeout_secs, 30);
        assert_eq!(cfg.scheduler.run_timeout_secs, 1800);
        assert_eq!(cfg.retention.max_age_days, 14);
        assert_eq!(cfg.retention.max_tasks, 500);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config::default();
        let encoded = serde_json::to_string(&cfg).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.scheduler.max_workers, cfg.scheduler.max_workers);
    }
}
