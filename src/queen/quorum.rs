// ABOUTME: Quorum merge - collapses pending tasks independently declared for the same files.
// ABOUTME: Pure: returns the tasks that changed so the caller can persist them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use crate::model::{Caste, PRIORITY_MIN, Task, TaskStatus};

/// Merge duplicate pending tasks.
///
/// Pending tasks of the same caste with an identical, non-empty file set
/// form a group. The earliest in `tasks` order is kept, its priority raised
/// by one step and its context set to every member's context joined. The
/// rest are marked done with a note naming the keeper. Returns the modified
/// tasks, keepers first within each group.
pub fn quorum_merge(tasks: &[Task]) -> Vec<Task> {
    let mut groups: BTreeMap<(Caste, BTreeSet<&str>), Vec<&Task>> = BTreeMap::new();
    let mut order = Vec::new();
    for task in tasks {
        if task.status != TaskStatus::Pending || task.files.is_empty() {
            continue;
        }
        let key = (task.caste, task.file_set());
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(task);
    }

    let mut changed = Vec::new();
    for key in order {
        let Some(group) = groups.get(&key) else {
            continue;
        };
        if group.len() < 2 {
            continue;
        }

        let mut keeper = group[0].clone();
        keeper.priority = keeper.priority.saturating_sub(1).max(PRIORITY_MIN);
        let contexts: Vec<&str> = group
            .iter()
            .filter_map(|t| t.context.as_deref())
            .filter(|c| !c.trim().is_empty())
            .collect();
        if !contexts.is_empty() {
            keeper.context = Some(contexts.join("\n---\n"));
        }

        let now = Utc::now();
        let merged: Vec<Task> = group[1..]
            .iter()
            .map(|dup| {
                let mut dup = (*dup).clone();
                dup.status = TaskStatus::Done;
                dup.result = Some(format!("Merged into {} by quorum", keeper.id));
                dup.finished_at = Some(now);
                dup
            })
            .collect();

        changed.push(keeper);
        changed.extend(merged);
    }
    changed
}
