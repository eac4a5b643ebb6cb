//! Core engine - task model, dependency graph, scheduling and progress

mod executor;
mod graph;
mod progress;
mod scheduler;
mod summary;
mod task;

pub use executor::{CancelHandle, ConcurrentExecutor, DEPENDENCY_FAILED};
pub use graph::{Batches, GraphError, TaskGraph};
pub use progress::{ExecutionProgress, ProgressCallback, ProgressTracker, ProgressUpdate};
pub use scheduler::{Readiness, RunState};
pub use summary::{CriticalError, ErrorSummary, ExecutionSummary};
pub use task::{classify, ErrorKind, Metadata, Task, TaskContext, TaskError, TaskResult, WorkFn};
