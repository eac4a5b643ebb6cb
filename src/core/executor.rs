//! Concurrent Executor - runs task batches on a bounded worker pool
//!
//! Work units are blocking closures. Each one runs on tokio's blocking
//! thread pool via `spawn_blocking`, gated by a semaphore sized to
//! `max_workers`. Batches are separated by a barrier: batch N is only
//! submitted once batch N-1 has fully drained.

use super::graph::{GraphError, TaskGraph};
use super::progress::{ExecutionProgress, ProgressCallback, ProgressTracker, ProgressUpdate};
use super::scheduler::{Readiness, RunState};
use super::summary::{ErrorSummary, ExecutionSummary};
use super::task::{classify, ErrorKind, Metadata, Task, TaskContext, TaskResult};
use crate::config::EngineConfig;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Error recorded on tasks skipped because of an upstream failure
pub const DEPENDENCY_FAILED: &str = "required dependency failed";

const CANCELLED: &str = "execution cancelled";
const HALTED: &str = "execution halted after required task failure";

/// Cooperative cancellation flag shared with callers (API, signal handler)
///
/// Cancelling stops submission of further tasks; tasks already running
/// finish naturally and are reported as usual.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Identity of a task kept aside so a result can still be built when
/// the task itself has been moved into a worker
#[derive(Debug, Clone)]
struct TaskStub {
    id: String,
    required: bool,
    metadata: Metadata,
}

impl TaskStub {
    fn of<T>(task: &Task<T>) -> Self {
        Self {
            id: task.id.clone(),
            required: task.required,
            metadata: task.metadata.clone(),
        }
    }

    fn skipped<T>(self, kind: ErrorKind, error: &str) -> TaskResult<T> {
        TaskResult::skipped(self.id, self.required, self.metadata, kind, error)
    }

    fn failed<T>(self, kind: ErrorKind, error: String) -> TaskResult<T> {
        TaskResult::failed(
            self.id,
            self.required,
            self.metadata,
            kind,
            kind.as_str().to_string(),
            error,
            Duration::ZERO,
        )
    }
}

#[derive(Debug, Default)]
struct LastRun {
    errors: ErrorSummary,
    wall_time: Option<Duration>,
}

/// Dependency-aware executor with a flat, bounded worker pool
///
/// One run at a time: progress, cancellation and the last error summary
/// belong to the executor, so overlapping calls on the same executor wait
/// for the active run to finish before starting.
pub struct ConcurrentExecutor {
    max_workers: usize,
    fail_fast: bool,
    workers: Arc<Semaphore>,
    run_lock: tokio::sync::Mutex<()>,
    progress: Mutex<Arc<ProgressTracker>>,
    last_run: Mutex<LastRun>,
    cancel: CancelHandle,
}

impl ConcurrentExecutor {
    /// Create an executor running at most `max_workers` tasks at once
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            fail_fast: false,
            workers: Arc::new(Semaphore::new(max_workers)),
            run_lock: tokio::sync::Mutex::new(()),
            progress: Mutex::new(Arc::new(ProgressTracker::new(0))),
            last_run: Mutex::new(LastRun::default()),
            cancel: CancelHandle::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_workers).with_fail_fast(config.fail_fast)
    }

    /// Stop submitting batches once a required task has failed
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Handle that cancels the current run from any thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        log::info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Run every task as one batch, ignoring declared dependencies
    pub async fn execute_concurrent<T>(
        &self,
        tasks: Vec<Task<T>>,
        progress_callback: Option<ProgressCallback>,
    ) -> Vec<TaskResult<T>>
    where
        T: Clone + Send + 'static,
    {
        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        let tracker = self.begin_run(tasks.len(), progress_callback);
        log::info!(
            "Executing {} tasks concurrently (max_workers={})",
            tasks.len(),
            self.max_workers
        );

        let mut state = RunState::new(tasks.iter().map(|t| t.id.clone()).collect());
        let jobs = tasks
            .into_iter()
            .enumerate()
            .map(|(idx, task)| {
                let ctx = TaskContext::new(task.id.clone(), task.metadata.clone(), HashMap::new());
                (idx, task, ctx)
            })
            .collect();

        for (idx, result) in self.run_batch(&tracker, jobs).await {
            state.record(idx, result);
        }

        let results = state.into_results();
        self.finish_run(&results, started);
        results
    }

    /// Run tasks level by level, skipping dependents of failed required tasks
    ///
    /// Without an explicit `dependency_graph` the graph is built from each
    /// task's declared dependencies. Graph errors are returned before any
    /// task runs.
    pub async fn execute_with_dependencies<T>(
        &self,
        tasks: Vec<Task<T>>,
        dependency_graph: Option<TaskGraph>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<Vec<TaskResult<T>>, GraphError>
    where
        T: Clone + Send + 'static,
    {
        let graph = match dependency_graph {
            Some(mut graph) => {
                graph.align_with(&tasks)?;
                graph
            }
            None => TaskGraph::from_tasks(&tasks)?,
        };
        let batches = graph.batches().map_err(|e| {
            log::error!("Task graph rejected: {}", e);
            e
        })?;

        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        let tracker = self.begin_run(tasks.len(), progress_callback);
        let batch_count = batches.len();
        log::info!(
            "Executing {} tasks in {} batches (max_workers={})",
            tasks.len(),
            batch_count,
            self.max_workers
        );

        let mut state = RunState::new(tasks.iter().map(|t| t.id.clone()).collect());
        let mut slots: Vec<Option<Task<T>>> = tasks.into_iter().map(Some).collect();
        let mut halted = false;

        for (n, batch) in batches.iter().enumerate() {
            let mut jobs = Vec::with_capacity(batch.len());

            for task_id in batch {
                let Some(idx) = state.index_of(task_id) else {
                    continue;
                };
                let Some(task) = slots.get_mut(idx).and_then(Option::take) else {
                    continue;
                };

                if halted || self.cancel.is_cancelled() {
                    let reason = if halted { HALTED } else { CANCELLED };
                    state.record(idx, TaskStub::of(&task).skipped(ErrorKind::Cancelled, reason));
                    tracker.update(ProgressUpdate::Skipped);
                    continue;
                }

                let deps = graph.dependencies_of(task_id);
                match state.readiness(deps) {
                    Readiness::Blocked { dependency } => {
                        log::warn!(
                            "Skipping task {}: dependency {} did not succeed",
                            task_id,
                            dependency
                        );
                        state.record(
                            idx,
                            TaskStub::of(&task).skipped(ErrorKind::DependencyFailed, DEPENDENCY_FAILED),
                        );
                        tracker.update(ProgressUpdate::Skipped);
                    }
                    Readiness::Ready => {
                        let ctx = TaskContext::new(
                            task.id.clone(),
                            task.metadata.clone(),
                            state.dependency_outputs(deps),
                        );
                        jobs.push((idx, task, ctx));
                    }
                }
            }

            if jobs.is_empty() {
                continue;
            }

            log::info!("Batch {}/{}: running {} tasks", n + 1, batch_count, jobs.len());
            let outcomes = self.run_batch(&tracker, jobs).await;

            let required_failed = outcomes.iter().any(|(_, r)| r.required && r.is_failure());
            for (idx, result) in outcomes {
                state.record(idx, result);
            }

            if self.fail_fast && required_failed && !halted {
                log::warn!(
                    "Required task failed in batch {}/{}; not submitting further batches",
                    n + 1,
                    batch_count
                );
                halted = true;
            }
        }

        let results = state.into_results();
        self.finish_run(&results, started);
        Ok(results)
    }

    /// Snapshot of the current (or last) run's progress
    pub fn get_progress(&self) -> ExecutionProgress {
        self.current_tracker().get_stats()
    }

    /// Errors of the most recent run
    pub fn get_error_summary(&self) -> ErrorSummary {
        self.last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .errors
            .clone()
    }

    pub fn get_execution_summary<T>(&self, results: &[TaskResult<T>]) -> ExecutionSummary {
        let summary = ExecutionSummary::from_results(results);
        let wall_time = self.last_run.lock().unwrap_or_else(|e| e.into_inner()).wall_time;
        match wall_time {
            Some(wall_time) => summary.with_wall_time(wall_time),
            None => summary,
        }
    }

    fn current_tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn begin_run(&self, total: usize, callback: Option<ProgressCallback>) -> Arc<ProgressTracker> {
        self.cancel.reset();

        let tracker = Arc::new(ProgressTracker::new(total));
        if let Some(callback) = callback {
            tracker.add_callback(callback);
        }
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&tracker);
        tracker
    }

    fn finish_run<T>(&self, results: &[TaskResult<T>], started: Instant) {
        let errors = ErrorSummary::from_results(results);
        let wall_time = started.elapsed();

        log::info!(
            "Run finished in {:.2?}: {} tasks, {} failed, {} skipped",
            wall_time,
            results.len(),
            errors.failed_tasks.len(),
            errors.skipped_tasks.len()
        );
        if errors.has_critical_errors() {
            log::warn!("{} required tasks did not succeed", errors.critical_errors.len());
        }

        let mut last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        last_run.errors = errors;
        last_run.wall_time = Some(wall_time);
    }

    /// Submit one batch and wait for all of it; results come back paired
    /// with their input index
    async fn run_batch<T>(
        &self,
        tracker: &Arc<ProgressTracker>,
        jobs: Vec<(usize, Task<T>, TaskContext<T>)>,
    ) -> Vec<(usize, TaskResult<T>)>
    where
        T: Send + 'static,
    {
        let mut handles = Vec::with_capacity(jobs.len());

        for (idx, task, ctx) in jobs {
            let stub = TaskStub::of(&task);
            let worker_stub = stub.clone();
            let workers = Arc::clone(&self.workers);
            let tracker = Arc::clone(tracker);
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(async move {
                let permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracker.update(ProgressUpdate::Skipped);
                        return worker_stub.skipped(ErrorKind::Cancelled, "worker pool closed");
                    }
                };

                if cancel.is_cancelled() {
                    tracker.update(ProgressUpdate::Skipped);
                    return worker_stub.skipped(ErrorKind::Cancelled, CANCELLED);
                }

                let blocking_tracker = Arc::clone(&tracker);
                let joined = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    run_task(task, ctx, &blocking_tracker)
                })
                .await;

                match joined {
                    Ok(result) => result,
                    Err(e) => {
                        log::error!("Worker for task {} did not complete: {}", worker_stub.id, e);
                        tracker.update(ProgressUpdate::Failed);
                        let kind = if e.is_panic() {
                            ErrorKind::Panic
                        } else {
                            ErrorKind::Cancelled
                        };
                        worker_stub.failed(kind, e.to_string())
                    }
                }
            });

            handles.push((idx, stub, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (idx, stub, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Scheduling task {} failed: {}", stub.id, e);
                    tracker.update(ProgressUpdate::Failed);
                    stub.failed(ErrorKind::Runtime, e.to_string())
                }
            };
            outcomes.push((idx, result));
        }
        outcomes
    }
}

impl Default for ConcurrentExecutor {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Per-task error boundary: errors and panics become a failed result
fn run_task<T>(task: Task<T>, ctx: TaskContext<T>, tracker: &ProgressTracker) -> TaskResult<T> {
    let Task {
        id,
        work,
        required,
        metadata,
        ..
    } = task;

    tracker.update(ProgressUpdate::Started);
    log::debug!("Task {} started", id);

    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || work(&ctx)));
    let elapsed = start.elapsed();

    match outcome {
        Ok(Ok(value)) => {
            log::debug!("Task {} succeeded in {:.2?}", id, elapsed);
            tracker.update(ProgressUpdate::Succeeded);
            TaskResult::succeeded(id, required, metadata, value, elapsed)
        }
        Ok(Err(err)) => {
            let (kind, error_type) = classify(&err);
            log::warn!("Task {} failed ({}): {:#}", id, error_type, err);
            tracker.update(ProgressUpdate::Failed);
            TaskResult::failed(id, required, metadata, kind, error_type, format!("{:#}", err), elapsed)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Task {} panicked: {}", id, message);
            tracker.update(ProgressUpdate::Failed);
            TaskResult::failed(
                id,
                required,
                metadata,
                ErrorKind::Panic,
                ErrorKind::Panic.as_str().to_string(),
                message,
                elapsed,
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let executor = ConcurrentExecutor::new(4);
        let tasks: Vec<Task<usize>> = (0..8)
            .map(|i| {
                Task::from_fn(format!("t{}", i), move || {
                    std::thread::sleep(Duration::from_millis(((8 - i) * 5) as u64));
                    Ok(i)
                })
            })
            .collect();

        let results = executor.execute_concurrent(tasks, None).await;
        let ids: Vec<_> = results.iter().map(|r| r.task_id.clone()).collect();
        let expected: Vec<_> = (0..8).map(|i| format!("t{}", i)).collect();
        assert_eq!(ids, expected);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let executor = ConcurrentExecutor::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<()>> = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                Task::from_fn(format!("t{}", i), move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        executor.execute_concurrent(tasks, None).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_isolated() {
        let executor = ConcurrentExecutor::new(3);
        let tasks: Vec<Task<i32>> = vec![
            Task::from_fn("ok", || Ok(1)),
            Task::from_fn("bad", || Err(TaskError::new("ValueError", "bad score").into())),
            Task::from_fn("panics", || panic!("worker exploded")),
        ];

        let results = executor.execute_concurrent(tasks, None).await;
        assert!(results[0].success);
        assert_eq!(results[1].error_type.as_deref(), Some("ValueError"));
        assert_eq!(results[1].error.as_deref(), Some("ValueError: bad score"));
        assert_eq!(results[2].error_kind, Some(ErrorKind::Panic));
        assert!(results[2].error.as_deref().unwrap().contains("worker exploded"));
    }

    #[tokio::test]
    async fn test_dependency_outputs_flow_to_dependents() {
        let executor = ConcurrentExecutor::new(2);
        let tasks: Vec<Task<i32>> = vec![
            Task::from_fn("a", || Ok(2)),
            Task::from_fn("b", || Ok(3)),
            Task::new("sum", |ctx| {
                let a = ctx.dependency_output("a").copied().unwrap_or_default();
                let b = ctx.dependency_output("b").copied().unwrap_or_default();
                Ok(a + b)
            })
            .with_dependencies(["a", "b"]),
        ];

        let results = executor.execute_with_dependencies(tasks, None, None).await.unwrap();
        assert_eq!(results[2].result, Some(5));
    }

    #[tokio::test]
    async fn test_explicit_graph_overrides_declared_dependencies() {
        let executor = ConcurrentExecutor::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));

        let make = |id: &'static str| {
            let order = order.clone();
            Task::from_fn(id, move || {
                order.lock().unwrap().push(id);
                Ok(())
            })
        };
        let tasks: Vec<Task<()>> = vec![make("second"), make("first")];

        let mut graph = TaskGraph::new();
        graph.add_dependency("second", "first");

        let results = executor
            .execute_with_dependencies(tasks, Some(graph), None)
            .await
            .unwrap();
        assert_eq!(results[0].task_id, "second");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_fail_fast_halts_later_batches() {
        let executor = ConcurrentExecutor::new(2).with_fail_fast(true);
        let tasks: Vec<Task<()>> = vec![
            Task::from_fn("a", || anyhow::bail!("nope")),
            Task::from_fn("b", || Ok(())),
            Task::from_fn("c", || Ok(())).depends_on("b"),
        ];

        let results = executor.execute_with_dependencies(tasks, None, None).await.unwrap();
        assert!(results[1].success);
        assert!(results[2].skipped);
        assert_eq!(results[2].error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_stops_later_batches() {
        let executor = ConcurrentExecutor::new(1);
        let handle = executor.cancel_handle();

        let tasks: Vec<Task<()>> = vec![
            Task::from_fn("first", move || {
                handle.cancel();
                Ok(())
            }),
            Task::from_fn("second", || Ok(())).depends_on("first"),
        ];

        let results = executor.execute_with_dependencies(tasks, None, None).await.unwrap();
        assert!(results[0].success);
        assert!(results[1].skipped);
        assert_eq!(results[1].error.as_deref(), Some("execution cancelled"));
        assert!(executor.cancel_handle().is_cancelled());
        assert_eq!(executor.get_progress().skipped, 1);
    }

    #[tokio::test]
    async fn test_progress_and_summaries() {
        let executor = ConcurrentExecutor::new(2);
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let callback: ProgressCallback = Arc::new(move |p: &ExecutionProgress| {
            sink.lock().unwrap().push(p.clone());
        });

        let tasks: Vec<Task<()>> = vec![
            Task::from_fn("a", || anyhow::bail!("down")),
            Task::from_fn("b", || Ok(())).depends_on("a"),
            Task::from_fn("c", || Ok(())),
        ];
        let results = executor
            .execute_with_dependencies(tasks, None, Some(callback))
            .await
            .unwrap();

        let progress = executor.get_progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.running, 0);

        let snapshots = snapshots.lock().unwrap();
        // a, c: started + finished; b: skipped
        assert_eq!(snapshots.len(), 5);
        assert_eq!(snapshots.last().unwrap().completed, 3);

        let errors = executor.get_error_summary();
        assert_eq!(errors.failed_tasks, vec!["a"]);
        assert_eq!(errors.skipped_tasks, vec!["b"]);

        let summary = executor.get_execution_summary(&results);
        assert!(!summary.is_successful());
        assert!(summary.wall_time.is_some());
    }

    #[tokio::test]
    async fn test_graph_error_runs_nothing() {
        let executor = ConcurrentExecutor::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        let tasks: Vec<Task<()>> = vec![Task::from_fn("a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .depends_on("missing")];

        let err = executor.execute_with_dependencies(tasks, None, None).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
        assert_eq!(err.kind(), ErrorKind::UnknownDependency);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let executor = ConcurrentExecutor::default();
        let results: Vec<TaskResult<()>> = executor.execute_concurrent(Vec::new(), None).await;
        assert!(results.is_empty());
        assert!(executor.get_error_summary().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_runs_do_not_interleave() {
        let executor = ConcurrentExecutor::new(2);
        let events = Arc::new(Mutex::new(Vec::new()));

        let recorder = |label: &'static str| -> ProgressCallback {
            let events = events.clone();
            Arc::new(move |p: &ExecutionProgress| events.lock().unwrap().push((label, p.total)))
        };
        let slow = |id: &str| {
            Task::from_fn(id, || {
                std::thread::sleep(Duration::from_millis(30));
                Ok(1)
            })
        };

        let (first, second) = tokio::join!(
            executor.execute_concurrent(vec![slow("a1"), slow("a2"), slow("a3")], Some(recorder("first"))),
            executor.execute_with_dependencies(vec![slow("b1"), slow("b2").depends_on("b1")], None, Some(recorder("second"))),
        );
        assert!(first.iter().all(|r| r.success));
        assert!(second.unwrap().iter().all(|r| r.success));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 10);
        let switches = events.windows(2).filter(|w| w[0].0 != w[1].0).count();
        assert_eq!(switches, 1, "runs interleaved: {:?}", *events);
        assert!(events.iter().all(|(label, total)| match *label {
            "first" => *total == 3,
            _ => *total == 2,
        }));
    }
}
