//! Task model - work units, their outcomes and failure classification

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Free-form key/value map carried from a task to its result untouched
pub type Metadata = HashMap<String, serde_json::Value>;

/// Boxed work unit - runs once on a worker thread
pub type WorkFn<T> = Box<dyn FnOnce(&TaskContext<T>) -> anyhow::Result<T> + Send + 'static>;

/// Closed classification of why a task did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Runtime,
    Timeout,
    DependencyFailed,
    Cycle,
    UnknownDependency,
    Panic,
    Cancelled,
}

impl ErrorKind {
    /// Default `error_type` string reported for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "RuntimeError",
            Self::Timeout => "TimeoutError",
            Self::DependencyFailed => "DependencyFailed",
            Self::Cycle => "CycleError",
            Self::UnknownDependency => "UnknownDependencyError",
            Self::Panic => "Panic",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure a work unit can return to control its `error_type`
///
/// ```
/// use promptlab_engine::TaskError;
///
/// let err = TaskError::new("ValueError", "score out of range");
/// assert_eq!(err.to_string(), "ValueError: score out of range");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct TaskError {
    pub error_type: String,
    pub message: String,
}

impl TaskError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout.as_str(), message)
    }
}

/// Map an error returned by a work unit onto a kind and an `error_type` name
pub fn classify(err: &anyhow::Error) -> (ErrorKind, String) {
    if let Some(task_err) = err.downcast_ref::<TaskError>() {
        let kind = if task_err.error_type == ErrorKind::Timeout.as_str() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Runtime
        };
        return (kind, task_err.error_type.clone());
    }

    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return (ErrorKind::Timeout, ErrorKind::Timeout.as_str().to_string());
    }

    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        if io_err.kind() == std::io::ErrorKind::TimedOut {
            return (ErrorKind::Timeout, ErrorKind::Timeout.as_str().to_string());
        }
        return (ErrorKind::Runtime, "IoError".to_string());
    }

    if err.downcast_ref::<serde_json::Error>().is_some() {
        return (ErrorKind::Runtime, "JsonError".to_string());
    }

    (ErrorKind::Runtime, ErrorKind::Runtime.as_str().to_string())
}

/// What a work unit sees while it runs
#[derive(Debug, Clone)]
pub struct TaskContext<T> {
    task_id: String,
    metadata: Metadata,
    dependency_outputs: HashMap<String, T>,
}

impl<T> TaskContext<T> {
    pub(crate) fn new(task_id: String, metadata: Metadata, dependency_outputs: HashMap<String, T>) -> Self {
        Self {
            task_id,
            metadata,
            dependency_outputs,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Result of a direct dependency that succeeded
    pub fn dependency_output(&self, task_id: &str) -> Option<&T> {
        self.dependency_outputs.get(task_id)
    }

    pub fn dependency_outputs(&self) -> &HashMap<String, T> {
        &self.dependency_outputs
    }
}

/// A unit of work with an id, dependencies and a required/optional flag
///
/// Built once by the caller and consumed exactly once by the executor.
pub struct Task<T> {
    pub(crate) id: String,
    pub(crate) work: WorkFn<T>,
    pub(crate) dependencies: Vec<String>,
    pub(crate) required: bool,
    pub(crate) metadata: Metadata,
}

impl<T> Task<T> {
    /// Create a required task with no dependencies
    pub fn new<F>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&TaskContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            id: id.into(),
            work: Box::new(work),
            dependencies: Vec::new(),
            required: true,
            metadata: Metadata::new(),
        }
    }

    /// Create a task from a closure that ignores its context
    pub fn from_fn<F>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::new(id, move |_ctx| work())
    }

    /// Add a dependency (duplicates are ignored)
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
        }
        self
    }

    pub fn with_dependencies<I, S>(self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        task_ids.into_iter().fold(self, |task, id| task.depends_on(id))
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Shorthand for `required(false)`
    pub fn optional(self) -> Self {
        self.required(false)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("required", &self.required)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Outcome of one task, placed at its task's input index
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub skipped: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub execution_time: Duration,
    pub required: bool,
    pub metadata: Metadata,
}

impl<T> TaskResult<T> {
    pub(crate) fn succeeded(
        task_id: String,
        required: bool,
        metadata: Metadata,
        value: T,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            success: true,
            result: Some(value),
            error: None,
            error_type: None,
            error_kind: None,
            skipped: false,
            execution_time,
            required,
            metadata,
        }
    }

    pub(crate) fn failed(
        task_id: String,
        required: bool,
        metadata: Metadata,
        kind: ErrorKind,
        error_type: String,
        error: String,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error),
            error_type: Some(error_type),
            error_kind: Some(kind),
            skipped: false,
            execution_time,
            required,
            metadata,
        }
    }

    /// A task that never ran; `kind` is `DependencyFailed` or `Cancelled`
    pub(crate) fn skipped(
        task_id: String,
        required: bool,
        metadata: Metadata,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error.into()),
            error_type: Some(kind.as_str().to_string()),
            error_kind: Some(kind),
            skipped: true,
            execution_time: Duration::ZERO,
            required,
            metadata,
        }
    }

    /// Failed but actually ran (not a skip)
    pub fn is_failure(&self) -> bool {
        !self.success && !self.skipped
    }

    /// Whether dependents of this task must be skipped
    pub fn blocks_dependents(&self) -> bool {
        self.skipped || (self.required && !self.success)
    }
}

pub(crate) fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
