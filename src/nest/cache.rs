// ABOUTME: In-memory task cache shadowing the per-task files.
// ABOUTME: Explicit population state decides when disk scans happen.

use std::collections::HashMap;

use crate::model::Task;

/// Cache of task records.
///
/// Invalidation rules:
/// - Empty and unpopulated at construction; the first full read scans the
///   task directory and populates it.
/// - `initialize` and `resume` replace it wholesale.
/// - Once populated it is authoritative for full reads; writes made through
///   the nest are applied to it as they happen.
/// - Lock-guarded claims always re-read the task file and refresh the entry.
#[derive(Debug, Default)]
pub struct TaskCache {
    populated: bool,
    order: Vec<String>,
    tasks: HashMap<String, Task>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Replace every entry and mark the cache populated. Tasks are kept in
    /// creation order.
    pub fn replace_all(&mut self, mut tasks: Vec<Task>) {
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.order = tasks.iter().map(|t| t.id.clone()).collect();
        self.tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        self.populated = true;
    }

    /// Insert or replace one entry without changing population state.
    pub fn upsert(&mut self, task: Task) {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Every cached task in arrival order.
    pub fn all(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    /// Drop every entry and return to the unpopulated state.
    pub fn invalidate(&mut self) {
        self.populated = false;
        self.order.clear();
        self.tasks.clear();
    }
}
