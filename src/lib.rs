//! PromptLab engine - concurrent task execution and batch aggregation
//!
//! Runs independent work units on a bounded worker pool, orders dependent
//! ones through a task graph (skipping whatever a failed required task
//! blocks), tracks progress, and reduces batch outputs with pluggable
//! aggregation strategies.

pub mod aggregate;
pub mod config;
pub mod core;
pub mod plan;

// Re-exports
pub use aggregate::{AggregateError, AggregationResult, AggregationStrategy, BatchAggregator};
pub use config::EngineConfig;
pub use core::{
    CancelHandle, ConcurrentExecutor, ErrorKind, ErrorSummary, ExecutionProgress, ExecutionSummary,
    GraphError, ProgressCallback, ProgressTracker, Task, TaskContext, TaskError, TaskGraph, TaskResult,
};
pub use plan::Plan;

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
