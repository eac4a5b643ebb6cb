//! Task graph - validates the dependency relation and splits it into batches

use super::task::Task;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Ordered parallel-execution levels; every dependency of a task in
/// batch `k` lives in a batch before `k`
pub type Batches = Vec<Vec<String>>;

/// Fatal graph problems, reported before any task runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cycle detected in task graph: {}", .cycle_path.join(" -> "))]
    Cycle { cycle_path: Vec<String> },

    #[error("Task {task_id} depends on unknown task {missing_dep}")]
    UnknownDependency { task_id: String, missing_dep: String },

    #[error("Task graph references unknown task {task_id}")]
    UnknownTask { task_id: String },

    #[error("Duplicate task id: {task_id}")]
    DuplicateTask { task_id: String },
}

impl GraphError {
    pub fn kind(&self) -> super::ErrorKind {
        match self {
            Self::Cycle { .. } => super::ErrorKind::Cycle,
            _ => super::ErrorKind::UnknownDependency,
        }
    }
}

/// Dependency relation keyed by task id
///
/// Keeps insertion order so batches come out deterministic.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the relation from each task's declared dependencies
    pub fn from_tasks<T>(tasks: &[Task<T>]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for task in tasks {
            if graph.deps.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask {
                    task_id: task.id.clone(),
                });
            }
            graph.add_task(task.id.clone());
            for dep in &task.dependencies {
                graph.add_dependency(&task.id, dep.clone());
            }
        }
        Ok(graph)
    }

    /// Validate the tasks and return their batches in one step
    pub fn build<T>(tasks: &[Task<T>]) -> Result<Batches, GraphError> {
        Self::from_tasks(tasks)?.batches()
    }

    /// Register a task with no dependencies (no-op if already present)
    pub fn add_task(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        if !self.deps.contains_key(&task_id) {
            self.order.push(task_id.clone());
            self.deps.insert(task_id, Vec::new());
        }
    }

    /// Record that `task_id` must wait for `dep`
    pub fn add_dependency(&mut self, task_id: &str, dep: impl Into<String>) {
        self.add_task(task_id);
        let dep = dep.into();
        if let Some(deps) = self.deps.get_mut(task_id) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.deps.contains_key(task_id)
    }

    /// Immediate dependencies of a task
    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.deps.get(task_id).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Immediate dependents of a task
    pub fn dependents_of(&self, task_id: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.dependencies_of(id).iter().any(|d| d == task_id))
            .map(|id| id.as_str())
            .collect()
    }

    /// Make sure the graph and the task list describe the same tasks;
    /// tasks missing from the graph are added without dependencies
    pub(crate) fn align_with<T>(&mut self, tasks: &[Task<T>]) -> Result<(), GraphError> {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(GraphError::DuplicateTask {
                    task_id: task.id.clone(),
                });
            }
        }

        if let Some(extra) = self.order.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(GraphError::UnknownTask {
                task_id: extra.clone(),
            });
        }

        for task in tasks {
            self.add_task(task.id.clone());
        }
        Ok(())
    }

    /// Check that every dependency exists and there are no cycles
    pub fn validate(&self) -> Result<(), GraphError> {
        for task_id in &self.order {
            for dep in self.dependencies_of(task_id) {
                if !self.deps.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task_id: task_id.clone(),
                        missing_dep: dep.clone(),
                    });
                }
            }
        }

        match self.find_cycle() {
            Some(cycle_path) => Err(GraphError::Cycle { cycle_path }),
            None => Ok(()),
        }
    }

    /// Depth-first search with a recursion stack; returns the first
    /// back-edge found as a closed path (`a -> b -> a`)
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for task_id in &self.order {
            if !visited.contains(task_id.as_str()) {
                if let Some(cycle) = self.visit(task_id, &mut visited, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        task_id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(task_id);
        stack.push(task_id);

        for dep in self.dependencies_of(task_id) {
            if let Some(pos) = stack.iter().position(|id| *id == dep.as_str()) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) && self.deps.contains_key(dep) {
                if let Some(cycle) = self.visit(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    /// Validate, then peel the graph into levels: batch `k` holds every
    /// unassigned task whose dependencies all sit in earlier batches
    pub fn batches(&self) -> Result<Batches, GraphError> {
        self.validate()?;

        let mut assigned: HashSet<&str> = HashSet::with_capacity(self.order.len());
        let mut batches = Vec::new();

        while assigned.len() < self.order.len() {
            let batch: Vec<&str> = self
                .order
                .iter()
                .map(|id| id.as_str())
                .filter(|id| !assigned.contains(id))
                .filter(|id| {
                    self.dependencies_of(id)
                        .iter()
                        .all(|dep| assigned.contains(dep.as_str()))
                })
                .collect();

            // validate() ruled out cycles, so every round makes progress
            if batch.is_empty() {
                break;
            }

            assigned.extend(batch.iter().copied());
            batches.push(batch.into_iter().map(String::from).collect());
        }

        Ok(batches)
    }
}
