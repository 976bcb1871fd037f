//! Task envelope and append-only ledger: correlation identifiers,
//! convergence budgets, fingerprinting, and durable operation history.
//! Backed by `sea-orm` over a single SQLite file, in the style of the
//! structural store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectOptions, Database, DatabaseConnection, QueryOrder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::actor::ActorRef;
use crate::errors::{CoreError, CoreResult};
use crate::integrity::{compute_integrity_hash, IntegrityHash};

/// Convergence budgets a task is opened with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budgets {
    pub max_mutations: u32,
    pub max_test_runs: u32,
    pub max_duration_secs: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_mutations: 50,
            max_test_runs: 50,
            max_duration_secs: 3600,
        }
    }
}

/// Live counters tracked against `Budgets` for the lifetime of a task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub mutation_count: u32,
    pub test_run_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    ClosedSuccess,
    ClosedFailed,
    ClosedInterrupted,
}

/// A client-opened correlation envelope. Carries no intent,
/// prompts, or reasoning — only identity, budgets, counters, and
/// fingerprint memory for convergence-stall detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub repo_id: String,
    pub opened_at: String,
    /// The VCS head identity at the moment this task was opened.
    pub head_id_at_open: String,
    pub closed_at: Option<String>,
    pub state: TaskState,
    pub budgets: Budgets,
    pub counters: Counters,
    pub created_by: ActorRef,
    pub last_mutation_fingerprint: Option<IntegrityHash>,
    pub last_failure_fingerprint: Option<IntegrityHash>,
    /// Consecutive repeats of `last_failure_fingerprint`; drives the
    /// convergence-stall signal.
    pub consecutive_stalls: u32,
}

impl Task {
    pub fn open(
        repo_id: impl Into<String>,
        created_by: ActorRef,
        budgets: Budgets,
        opened_at: impl Into<String>,
        head_id_at_open: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            repo_id: repo_id.into(),
            opened_at: opened_at.into(),
            head_id_at_open: head_id_at_open.into(),
            closed_at: None,
            state: TaskState::Open,
            budgets,
            counters: Counters::default(),
            created_by,
            last_mutation_fingerprint: None,
            last_failure_fingerprint: None,
            consecutive_stalls: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TaskState::Open
    }

    /// Increments the mutation counter, failing the task (closed-failed)
    /// when the budget is exceeded.
    pub fn record_mutation(&mut self) -> CoreResult<()> {
        if self.counters.mutation_count >= self.budgets.max_mutations {
            self.state = TaskState::ClosedFailed;
            return Err(CoreError::BudgetExhausted(format!(
                "max_mutations ({}) exceeded",
                self.budgets.max_mutations
            )));
        }
        self.counters.mutation_count += 1;
        Ok(())
    }

    pub fn record_test_run(&mut self) -> CoreResult<()> {
        if self.counters.test_run_count >= self.budgets.max_test_runs {
            self.state = TaskState::ClosedFailed;
            return Err(CoreError::BudgetExhausted(format!(
                "max_test_runs ({}) exceeded",
                self.budgets.max_test_runs
            )));
        }
        self.counters.test_run_count += 1;
        Ok(())
    }

    /// Records a fresh mutation fingerprint, returning `true` if it is
    /// identical to the previous one (a no-op mutation; the budget still
    /// consumes).
    pub fn observe_mutation_fingerprint(&mut self, fp: IntegrityHash) -> bool {
        let is_noop = self.last_mutation_fingerprint == Some(fp);
        self.last_mutation_fingerprint = Some(fp);
        is_noop
    }

    /// Records a fresh failure fingerprint, returning `true` if this is a
    /// convergence stall: an identical fingerprint to the last one.
    /// Tracks `consecutive_stalls` for the client to reason about strategy
    /// changes.
    pub fn observe_failure_fingerprint(&mut self, fp: IntegrityHash) -> bool {
        let stalled = self.last_failure_fingerprint == Some(fp);
        if stalled {
            self.consecutive_stalls += 1;
        } else {
            self.consecutive_stalls = 0;
        }
        self.last_failure_fingerprint = Some(fp);
        stalled
    }

    pub fn close(&mut self, state: TaskState, closed_at: impl Into<String>) {
        self.state = state;
        self.closed_at = Some(closed_at.into());
    }

    /// On daemon restart every open task transitions to interrupted; no
    /// task resumes implicitly.
    pub fn interrupt(&mut self, at: impl Into<String>) {
        if self.is_open() {
            self.close(TaskState::ClosedInterrupted, at);
        }
    }
}

/// One ledger entry. Append-only:
/// never updated or deleted in place once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub op_id: i64,
    pub task_id: Uuid,
    pub timestamp: String,
    pub duration_ms: u64,
    pub op_type: String,
    pub success: bool,
    pub repo_before_hash: String,
    pub repo_after_hash: String,
    pub changed_paths: Vec<PathBuf>,
    pub diff_stats: DiffStats,
    pub summary: Option<String>,
    pub mutation_fingerprint: Option<IntegrityHash>,
    pub failure_fingerprint: Option<IntegrityHash>,
    pub failure_class: Option<String>,
    pub failing_targets: Vec<String>,
    pub limit_triggered: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u32,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// Deterministic digest of `(sorted failing-target ids, normalized
/// exception family, normalized stack frames, exit code)`.
pub fn failure_fingerprint(
    mut failing_targets: Vec<String>,
    exception_family: &str,
    stack_frames: &[String],
    exit_code: i32,
) -> IntegrityHash {
    failing_targets.sort();
    #[derive(Serialize)]
    struct Key<'a> {
        failing_targets: Vec<String>,
        exception_family: &'a str,
        stack_frames: &'a [String],
        exit_code: i32,
    }
    compute_integrity_hash(&Key {
        failing_targets,
        exception_family,
        stack_frames,
        exit_code,
    })
    .expect("fingerprint inputs always serialize")
}

/// Deterministic digest of `(sorted changed paths, diff statistics,
/// symbols-changed set)`.
pub fn mutation_fingerprint(
    mut changed_paths: Vec<PathBuf>,
    diff_stats: DiffStats,
    mut symbols_changed: Vec<String>,
) -> IntegrityHash {
    changed_paths.sort();
    symbols_changed.sort();
    #[derive(Serialize)]
    struct Key {
        changed_paths: Vec<PathBuf>,
        diff_stats: DiffStats,
        symbols_changed: Vec<String>,
    }
    compute_integrity_hash(&Key {
        changed_paths,
        diff_stats,
        symbols_changed,
    })
    .expect("fingerprint inputs always serialize")
}

pub mod tasks {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "tasks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub task_id: String,
        pub repo_id: String,
        pub opened_at: String,
        pub closed_at: Option<String>,
        pub state: String,
        pub head_id_at_open: String,
        pub budgets_json: String,
        pub counters_json: String,
        pub created_by_json: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod operations {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "operations")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub op_id: i64,
        pub task_id: String,
        pub timestamp: String,
        pub duration_ms: i64,
        pub op_type: String,
        pub success: bool,
        pub repo_before_hash: String,
        pub repo_after_hash: String,
        pub changed_paths_json: String,
        pub diff_stats_json: String,
        pub summary: Option<String>,
        pub mutation_fingerprint: Option<String>,
        pub failure_fingerprint: Option<String>,
        pub failure_class: Option<String>,
        pub failing_targets_json: String,
        pub limit_triggered: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// The single-file transactional ledger database. Single
/// writer (the daemon), readers non-blocking, matching the structural
/// store's sea-orm conventions.
pub struct Ledger {
    db: DatabaseConnection,
}

impl Ledger {
    pub async fn open(sqlite_path: &std::path::Path) -> CoreResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", sqlite_path.display());
        let mut opts = ConnectOptions::new(url);
        opts.sqlx_logging(false);
        let db = Database::connect(opts).await?;
        let ledger = Self { db };
        ledger.ensure_schema().await?;
        info!(path = %sqlite_path.display(), "ledger opened");
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> CoreResult<()> {
        use sea_orm::ConnectionTrait;
        let backend = self.db.get_database_backend();
        let schema = sea_orm::Schema::new(backend);
        for stmt in [
            backend.build(&schema.create_table_from_entity(tasks::Entity)),
            backend.build(&schema.create_table_from_entity(operations::Entity)),
        ] {
            self.db.execute(stmt).await.ok();
        }
        Ok(())
    }

    pub async fn record_task_open(&self, task: &Task) -> CoreResult<()> {
        use sea_orm::EntityTrait;
        let model = tasks::ActiveModel {
            task_id: Set(task.task_id.to_string()),
            repo_id: Set(task.repo_id.clone()),
            opened_at: Set(task.opened_at.clone()),
            closed_at: Set(task.closed_at.clone()),
            state: Set(format!("{:?}", task.state)),
            head_id_at_open: Set(task.head_id_at_open.clone()),
            budgets_json: Set(serde_json::to_string(&task.budgets)?),
            counters_json: Set(serde_json::to_string(&task.counters)?),
            created_by_json: Set(serde_json::to_string(&task.created_by)?),
        };
        tasks::Entity::insert(model).exec(&self.db).await?;
        Ok(())
    }

    /// Appends an entry. Never updates an existing row — the ledger is
    /// write-once.
    pub async fn append(&self, entry: &LedgerEntry) -> CoreResult<()> {
        use sea_orm::EntityTrait;
        let model = operations::ActiveModel {
            op_id: Set(entry.op_id),
            task_id: Set(entry.task_id.to_string()),
            timestamp: Set(entry.timestamp.clone()),
            duration_ms: Set(entry.duration_ms as i64),
            op_type: Set(entry.op_type.clone()),
            success: Set(entry.success),
            repo_before_hash: Set(entry.repo_before_hash.clone()),
            repo_after_hash: Set(entry.repo_after_hash.clone()),
            changed_paths_json: Set(serde_json::to_string(&entry.changed_paths)?),
            diff_stats_json: Set(serde_json::to_string(&entry.diff_stats)?),
            summary: Set(entry.summary.clone()),
            mutation_fingerprint: Set(entry.mutation_fingerprint.map(|h| h.to_hex())),
            failure_fingerprint: Set(entry.failure_fingerprint.map(|h| h.to_hex())),
            failure_class: Set(entry.failure_class.clone()),
            failing_targets_json: Set(serde_json::to_string(&entry.failing_targets)?),
            limit_triggered: Set(entry.limit_triggered.clone()),
        };
        operations::Entity::insert(model).exec(&self.db).await?;
        Ok(())
    }

    /// Entries for one task, in strict insertion order.
    pub async fn entries_for_task(&self, task_id: Uuid) -> CoreResult<Vec<LedgerEntry>> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
        let rows = operations::Entity::find()
            .filter(operations::Column::TaskId.eq(task_id.to_string()))
            .order_by_asc(operations::Column::OpId)
            .all(&self.db)
            .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// Retention policy: prune tasks (and their operations) older than
    /// `max_age_days`, or beyond the `max_tasks` most-recently opened,
    /// whichever set is larger. Run on daemon start.
    pub async fn prune(&self, max_age_days: u32, max_tasks: usize) -> CoreResult<()> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};

        let mut rows = tasks::Entity::find().all(&self.db).await?;
        rows.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));

        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let mut doomed: Vec<String> = rows
            .iter()
            .skip(max_tasks)
            .map(|row| row.task_id.clone())
            .collect();
        for row in &rows {
            let stale = match DateTime::parse_from_rfc3339(&row.opened_at) {
                Ok(opened_at) => opened_at.with_timezone(&Utc) < cutoff,
                Err(e) => {
                    warn!(task_id = %row.task_id, error = %e, "unparsable opened_at timestamp, skipping age check");
                    false
                }
            };
            if stale && !doomed.contains(&row.task_id) {
                doomed.push(row.task_id.clone());
            }
        }

        if doomed.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        let deleted = operations::Entity::delete_many()
            .filter(operations::Column::TaskId.is_in(doomed.clone()))
            .exec(&txn)
            .await?
            .rows_affected;
        let tasks_deleted = tasks::Entity::delete_many()
            .filter(tasks::Column::TaskId.is_in(doomed.clone()))
            .exec(&txn)
            .await?
            .rows_affected;
        txn.commit().await?;

        info!(
            tasks_pruned = tasks_deleted,
            operations_pruned = deleted,
            "ledger retention pruning complete"
        );
        Ok(())
    }
}

fn row_to_entry(row: operations::Model) -> CoreResult<LedgerEntry> {
    Ok(LedgerEntry {
        op_id: row.op_id,
        task_id: row
            .task_id
            .parse()
            .map_err(|e| CoreError::InvariantViolation(format!("bad task_id in ledger row: {e}")))?,
        timestamp: row.timestamp,
        duration_ms: row.duration_ms as u64,
        op_type: row.op_type,
        success: row.success,
        repo_before_hash: row.repo_before_hash,
        repo_after_hash: row.repo_after_hash,
        changed_paths: serde_json::from_str(&row.changed_paths_json)?,
        diff_stats: serde_json::from_str(&row.diff_stats_json)?,
        summary: row.summary,
        mutation_fingerprint: row
            .mutation_fingerprint
            .map(|s| s.parse())
            .transpose()
            .map_err(CoreError::InvariantViolation)?,
        failure_fingerprint: row
            .failure_fingerprint
            .map(|s| s.parse())
            .transpose()
            .map_err(CoreError::InvariantViolation)?,
        failure_class: row.failure_class,
        failing_targets: serde_json::from_str(&row.failing_targets_json)?,
        limit_triggered: row.limit_triggered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhaustion_closes_task_failed() {
        let mut task = Task::open(
            "repo1",
            ActorRef::agent("bot").unwrap(),
            Budgets {
                max_mutations: 1,
                max_test_runs: 10,
                max_duration_secs: 60,
            },
            "2026-01-01T00:00:00Z",
            "deadbeef",
        );
        task.record_mutation().unwrap();
        let err = task.record_mutation().unwrap_err();
        assert!(matches!(err, CoreError::BudgetExhausted(_)));
        assert_eq!(task.state, TaskState::ClosedFailed);
    }

    #[test]
    fn identical_failure_fingerprints_signal_stall() {
        let mut task = Task::open(
            "repo1",
            ActorRef::agent("bot").unwrap(),
            Budgets::default(),
            "2026-01-01T00:00:00Z",
            "deadbeef",
        );
        let fp = failure_fingerprint(vec!["t1".into()], "AssertionError", &[], 1);
        assert!(!task.observe_failure_fingerprint(fp));
        assert!(task.observe_failure_fingerprint(fp));
        assert_eq!(task.consecutive_stalls, 1);
    }

    #[test]
    fn mutation_fingerprint_is_order_independent_over_paths() {
        let a = mutation_fingerprint(
            vec![PathBuf::from("b.rs"), PathBuf::from("a.rs")],
            DiffStats::default(),
            vec![],
        );
        let b = mutation_fingerprint(
            vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")],
            DiffStats::default(),
            vec![],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn interrupt_only_affects_open_tasks() {
        let mut task = Task::open(
            "repo1",
            ActorRef::system("daemon").unwrap(),
            Budgets::default(),
            "2026-01-01T00:00:00Z",
            "deadbeef",
        );
        task.close(TaskState::ClosedSuccess, "2026-01-01T00:01:00Z");
        task.interrupt("2026-01-01T00:02:00Z");
        assert_eq!(task.state, TaskState::ClosedSuccess);
    }

    fn entry_for(task_id: Uuid, op_id: i64, timestamp: &str) -> LedgerEntry {
        LedgerEntry {
            op_id,
            task_id,
            timestamp: timestamp.to_string(),
            duration_ms: 10,
            op_type: "mutation".to_string(),
            success: true,
            repo_before_hash: "a".repeat(40),
            repo_after_hash: "b".repeat(40),
            changed_paths: vec![PathBuf::from("a.rs")],
            diff_stats: DiffStats::default(),
            summary: None,
            mutation_fingerprint: None,
            failure_fingerprint: None,
            failure_class: None,
            failing_targets: vec![],
            limit_triggered: None,
        }
    }

    #[tokio::test]
    async fn prune_drops_stale_tasks_and_their_operations() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(&dir.path().join("ledger.sqlite")).await.unwrap();

        let old_task = Task::open(
            "repo1",
            ActorRef::agent("bot").unwrap(),
            Budgets::default(),
            "2020-01-01T00:00:00Z",
            "deadbeef",
        );
        let recent_task = Task::open(
            "repo1",
            ActorRef::agent("bot").unwrap(),
            Budgets::default(),
            "2026-07-28T00:00:00Z",
            "cafef00d",
        );
        ledger.record_task_open(&old_task).await.unwrap();
        ledger.record_task_open(&recent_task).await.unwrap();
        ledger
            .append(&entry_for(old_task.task_id, 1, "2020-01-01T00:01:00Z"))
            .await
            .unwrap();
        ledger
            .append(&entry_for(recent_task.task_id, 2, "2026-07-28T00:01:00Z"))
            .await
            .unwrap();

        ledger.prune(30, 500).await.unwrap();

        assert!(ledger.entries_for_task(old_task.task_id).await.unwrap().is_empty());
        assert_eq!(ledger.entries_for_task(recent_task.task_id).await.unwrap().len(), 1);
    }
}
