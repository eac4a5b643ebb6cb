//! Run state - index-mapped results and dependency readiness checks

use super::task::TaskResult;
use std::collections::HashMap;

/// Whether a task may be submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A dependency failed while required, or was itself skipped
    Blocked { dependency: String },
}

/// Per-run bookkeeping: one result slot per input task
pub struct RunState<T> {
    index_of: HashMap<String, usize>,
    results: Vec<Option<TaskResult<T>>>,
}

impl<T> RunState<T> {
    pub fn new(task_ids: Vec<String>) -> Self {
        let results = task_ids.iter().map(|_| None).collect();
        let index_of = task_ids
            .into_iter()
            .enumerate()
            .map(|(idx, id)| (id, idx))
            .collect();

        Self { index_of, results }
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index_of.get(task_id).copied()
    }

    /// Place a result at its task's slot; a slot is written only once
    pub fn record(&mut self, idx: usize, result: TaskResult<T>) {
        match self.results.get_mut(idx) {
            Some(slot @ None) => *slot = Some(result),
            Some(Some(existing)) => {
                log::warn!("Ignoring second result for task {}", existing.task_id);
            }
            None => log::warn!("Result index {} out of range", idx),
        }
    }

    pub fn result_of(&self, task_id: &str) -> Option<&TaskResult<T>> {
        self.index_of(task_id)
            .and_then(|idx| self.results.get(idx))
            .and_then(|slot| slot.as_ref())
    }

    /// Skip-cascade rule: a task is blocked if any dependency was skipped,
    /// or failed while marked required
    pub fn readiness(&self, dependencies: &[String]) -> Readiness {
        for dep in dependencies {
            match self.result_of(dep) {
                Some(result) if result.blocks_dependents() => {
                    return Readiness::Blocked {
                        dependency: dep.clone(),
                    };
                }
                Some(_) => {}
                // Batches guarantee dependencies finish first
                None => {
                    return Readiness::Blocked {
                        dependency: dep.clone(),
                    };
                }
            }
        }
        Readiness::Ready
    }

    /// Results of the listed dependencies that succeeded
    pub fn dependency_outputs(&self, dependencies: &[String]) -> HashMap<String, T>
    where
        T: Clone,
    {
        dependencies
            .iter()
            .filter_map(|dep| {
                let value = self.result_of(dep)?.result.clone()?;
                Some((dep.clone(), value))
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|slot| slot.is_some())
    }

    /// Results in input order
    pub fn into_results(self) -> Vec<TaskResult<T>> {
        debug_assert!(self.is_complete(), "every task must have a result");
        self.results.into_iter().flatten().collect()
    }
}
