//! Error and execution summaries computed from a finished result list

use super::task::{serialize_secs, TaskResult};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// A failed or skipped task that was marked required
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalError {
    pub task_id: String,
    pub error_type: String,
    pub error: String,
    pub skipped: bool,
}

/// Aggregated view of every non-successful outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub failed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,
    pub error_types: BTreeMap<String, usize>,
    pub critical_errors: Vec<CriticalError>,
}

impl ErrorSummary {
    pub fn from_results<T>(results: &[TaskResult<T>]) -> Self {
        let mut summary = Self::default();

        for result in results.iter().filter(|r| !r.success) {
            summary.total_errors += 1;
            if result.skipped {
                summary.skipped_tasks.push(result.task_id.clone());
            } else {
                summary.failed_tasks.push(result.task_id.clone());
            }

            let error_type = result
                .error_type
                .clone()
                .unwrap_or_else(|| "UnknownError".to_string());
            *summary.error_types.entry(error_type.clone()).or_insert(0) += 1;

            if result.required {
                summary.critical_errors.push(CriticalError {
                    task_id: result.task_id.clone(),
                    error_type,
                    error: result.error.clone().unwrap_or_default(),
                    skipped: result.skipped,
                });
            }
        }

        summary
    }

    pub fn is_empty(&self) -> bool {
        self.total_errors == 0
    }

    pub fn has_critical_errors(&self) -> bool {
        !self.critical_errors.is_empty()
    }
}

/// Totals, timing and errors of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub total_execution_time: Duration,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub wall_time: Option<Duration>,
    pub errors: ErrorSummary,
}

impl ExecutionSummary {
    pub fn from_results<T>(results: &[TaskResult<T>]) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|r| r.success).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = total - succeeded - skipped;

        Self {
            total,
            succeeded,
            failed,
            skipped,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            total_execution_time: results.iter().map(|r| r.execution_time).sum(),
            wall_time: None,
            errors: ErrorSummary::from_results(results),
        }
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = Some(wall_time);
        self
    }

    /// False iff any required task failed or was skipped
    pub fn is_successful(&self) -> bool {
        !self.errors.has_critical_errors()
    }
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{ErrorKind, Metadata};

    fn ok(id: &str) -> TaskResult<i32> {
        TaskResult::succeeded(id.to_string(), true, Metadata::new(), 1, Duration::from_millis(10))
    }

    fn fail(id: &str, required: bool, error_type: &str) -> TaskResult<i32> {
        TaskResult::failed(
            id.to_string(),
            required,
            Metadata::new(),
            ErrorKind::Runtime,
            error_type.to_string(),
            "boom".to_string(),
            Duration::from_millis(20),
        )
    }

    fn skip(id: &str, required: bool) -> TaskResult<i32> {
        TaskResult::skipped(
            id.to_string(),
            required,
            Metadata::new(),
            ErrorKind::DependencyFailed,
            "required dependency failed",
        )
    }

    #[test]
    fn test_error_summary_counts() {
        let results = vec![
            ok("a"),
            fail("b", true, "ValueError"),
            fail("c", false, "ValueError"),
            skip("d", true),
            fail("e", false, "TimeoutError"),
        ];

        let summary = ErrorSummary::from_results(&results);
        assert_eq!(summary.total_errors, 4);
        assert_eq!(summary.failed_tasks, vec!["b", "c", "e"]);
        assert_eq!(summary.skipped_tasks, vec!["d"]);
        assert_eq!(summary.error_types["ValueError"], 2);
        assert_eq!(summary.error_types["DependencyFailed"], 1);
        assert_eq!(summary.error_types["TimeoutError"], 1);

        let critical: Vec<_> = summary.critical_errors.iter().map(|e| e.task_id.as_str()).collect();
        assert_eq!(critical, vec!["b", "d"]);
    }

    #[test]
    fn test_optional_failures_keep_run_successful() {
        let results = vec![ok("a"), fail("b", false, "RuntimeError")];
        let summary = ExecutionSummary::from_results(&results);

        assert!(summary.is_successful());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.total_execution_time, Duration::from_millis(30));
    }

    #[test]
    fn test_required_skip_is_not_successful() {
        let results = vec![fail("a", false, "RuntimeError"), skip("b", true)];
        let summary = ExecutionSummary::from_results(&results).with_wall_time(Duration::from_secs(1));

        assert!(!summary.is_successful());
        assert_eq!(summary.skipped, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["wall_time"], serde_json::json!(1.0));
    }

    #[test]
    fn test_empty_results() {
        let results: Vec<TaskResult<i32>> = Vec::new();
        let summary = ExecutionSummary::from_results(&results);
        assert!(summary.is_successful());
        assert!(summary.errors.is_empty());
        assert_eq!(summary.success_rate, 0.0);
    }
}
