//! Test scheduler: cross-language target discovery via registered
//! adapters, cost-balanced bin-packing, worker-pool execution, and
//! deterministic result merge. Per-test-case parallelism and distributed
//! execution are explicitly out of scope.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{info, warn};

use crate::config::SchedulerConfig;

/// The smallest unit the scheduler manages for a given language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTarget {
    pub target_id: String,
    pub language: String,
    pub kind: TargetKind,
    pub command_template: String,
    pub working_dir: PathBuf,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    File,
    Package,
    Class,
    Module,
    Project,
}

/// Discovers targets and invokes them for one language. No concrete adapter ships in core — this is the
/// consumed interface only.
pub trait TestRunnerAdapter: Send + Sync {
    fn language(&self) -> &str;
    fn discover(&self, paths: &[PathBuf]) -> Vec<TestTarget>;
    fn invoke(&self, target: &TestTarget) -> InvocationOutcome;
}

/// Raw result of running one target, before parsing into a [`TargetResult`]:
/// exit code plus captured stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// One target's structured result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    pub outcome: Outcome,
    pub duration: Duration,
    pub failure_class: Option<String>,
    pub flaky: bool,
}

/// The merged, deterministic result of one scheduler run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunResult {
    pub results: Vec<TargetResult>,
    pub fail_fast_triggered: bool,
    /// Set when the run's global wall-clock budget was exceeded before all
    /// targets could be started; any unstarted targets are simply absent
    /// from `results`, not represented as failures.
    pub run_timed_out: bool,
}

impl RunResult {
    pub fn failing_target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .map(|r| r.target_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome != Outcome::Failed)
    }
}

/// Greedy cost-balanced bin-packing of `targets` across `workers` bins,
/// largest-cost-first. Deterministic: ties broken by
/// `target_id`.
fn pack(targets: &[TestTarget], workers: usize) -> Vec<Vec<TestTarget>> {
    let workers = workers.max(1);
    let mut sorted: Vec<&TestTarget> = targets.iter().collect();
    sorted.sort_by(|a, b| {
        b.estimated_cost
            .partial_cmp(&a.estimated_cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.target_id.cmp(&b.target_id))
    });

    let mut bins: Vec<Vec<TestTarget>> = vec![Vec::new(); workers];
    let mut bin_costs = vec![0.0f64; workers];
    for target in sorted {
        let (idx, _) = bin_costs
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                a.partial_cmp(b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ia.cmp(ib))
            })
            .expect("at least one worker bin");
        bin_costs[idx] += target.estimated_cost;
        bins[idx].push(target.clone());
    }
    bins
}

fn classify_outcome(invocation: &InvocationOutcome) -> (Outcome, Option<String>) {
    if invocation.timed_out {
        return (Outcome::Failed, Some("timeout".to_string()));
    }
    if invocation.exit_code == 0 {
        (Outcome::Passed, None)
    } else {
        (Outcome::Failed, Some(format!("exit_code={}", invocation.exit_code)))
    }
}

/// Rolling-median cost history per `target_id`.
/// Cost starts at one for unknown targets.
#[derive(Default)]
pub struct CostHistory {
    samples: Mutex<HashMap<String, Vec<f64>>>,
}

impl CostHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimate(&self, target_id: &str) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        match samples.get(target_id) {
            Some(s) if !s.is_empty() => median(s),
            _ => 1.0,
        }
    }

    pub fn record(&self, target_id: &str, duration_secs: f64) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.entry(target_id.to_string()).or_default().push(duration_secs);
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Coordinates discovery and execution across registered adapters.
pub struct TestScheduler {
    adapters: Vec<Arc<dyn TestRunnerAdapter>>,
    config: SchedulerConfig,
    history: Arc<CostHistory>,
}

impl TestScheduler {
    pub fn new(adapters: Vec<Arc<dyn TestRunnerAdapter>>, config: SchedulerConfig) -> Self {
        Self {
            adapters,
            config,
            history: Arc::new(CostHistory::new()),
        }
    }

    pub fn discover(&self, paths: &[PathBuf]) -> Vec<TestTarget> {
        let mut targets = Vec::new();
        for adapter in &self.adapters {
            for mut target in adapter.discover(paths) {
                target.estimated_cost = self.history.estimate(&target.target_id);
                targets.push(target);
            }
        }
        targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        targets
    }

    /// Runs `targets`, bin-packed across `min(workers, max_workers)`
    /// worker threads. Fail-fast, when configured, starts no further
    /// batches after the first failing batch completes.
    pub fn run(&self, targets: Vec<TestTarget>) -> RunResult {
        let worker_count = self.config.max_workers.max(1);
        let bins = pack(&targets, worker_count);
        let pool = ThreadPool::new(worker_count);

        let results: Arc<Mutex<Vec<TargetResult>>> = Arc::new(Mutex::new(Vec::new()));
        let fail_fast_hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let run_deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_secs);
        let run_timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));

        for bin in bins {
            let by_adapter = self.adapter_for_lookup();
            let results = Arc::clone(&results);
            let history = Arc::clone(&self.history);
            let fail_fast = self.config.fail_fast;
            let per_target_timeout = Duration::from_secs(self.config.per_target_timeout_secs);
            let fail_fast_hit = Arc::clone(&fail_fast_hit);
            let run_timed_out = Arc::clone(&run_timed_out);

            pool.execute(move || {
                for target in bin {
                    if fail_fast && fail_fast_hit.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    if Instant::now() >= run_deadline {
                        run_timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
                        break;
                    }
                    let Some(adapter) = by_adapter.get(&target.language) else {
                        warn!(language = %target.language, "no adapter registered for target language");
                        continue;
                    };
                    let started = Instant::now();
                    let mut invocation = adapter.invoke(&target);
                    let mut elapsed = started.elapsed();
                    if elapsed > per_target_timeout {
                        invocation.timed_out = true;
                        elapsed = per_target_timeout;
                    }
                    let (outcome, failure_class) = classify_outcome(&invocation);
                    history.record(&target.target_id, elapsed.as_secs_f64());
                    if outcome == Outcome::Failed && fail_fast {
                        fail_fast_hit.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    let mut results = results.lock().unwrap_or_else(|p| p.into_inner());
                    results.push(TargetResult {
                        target_id: target.target_id.clone(),
                        outcome,
                        duration: elapsed,
                        failure_class,
                        flaky: false,
                    });
                }
            });
        }
        pool.join();

        let mut results = Arc::try_unwrap(results)
            .map(|m| m.into_inner().unwrap_or_default())
            .unwrap_or_default();
        results.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        info!(
            targets = results.len(),
            failed = results.iter().filter(|r| r.outcome == Outcome::Failed).count(),
            "scheduler run complete"
        );

        RunResult {
            fail_fast_triggered: fail_fast_hit.load(std::sync::atomic::Ordering::SeqCst),
            run_timed_out: run_timed_out.load(std::sync::atomic::Ordering::SeqCst),
            results,
        }
    }

    fn adapter_for_lookup(&self) -> HashMap<String, Arc<dyn TestRunnerAdapter>> {
        self.adapters
            .iter()
            .map(|a| (a.language().to_string(), Arc::clone(a)))
            .collect()
    }
}

/// Compares two `RunResult`s for the same target set and marks any target
/// whose outcome differs between runs as flaky.
pub fn mark_flaky(first: &RunResult, second: &mut RunResult) {
    let first_outcomes: HashMap<&str, Outcome> = first
        .results
        .iter()
        .map(|r| (r.target_id.as_str(), r.outcome))
        .collect();
    for result in second.results.iter_mut() {
        if let Some(prior) = first_outcomes.get(result.target_id.as_str()) {
            if *prior != result.outcome {
                result.flaky = true;
            }
        }
    }
}
