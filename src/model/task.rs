// ABOUTME: Task record - the unit of work claimed and executed by one ant.
// ABOUTME: Defines castes, the status lifecycle, and file-scope helpers.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Behavioral category of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Caste {
    /// Explores the codebase and declares work.
    Scout,
    /// Executes changes.
    Worker,
    /// Reviews completed work and declares fixes.
    Soldier,
}

impl Caste {
    pub const ALL: [Caste; 3] = [Caste::Scout, Caste::Worker, Caste::Soldier];

    /// Parse a caste name, accepting the common role aliases.
    /// Unknown names map to `Worker`.
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "scout" | "explorer" | "explore" => Caste::Scout,
            "soldier" | "reviewer" | "review" => Caste::Soldier,
            _ => Caste::Worker,
        }
    }
}

impl fmt::Display for Caste {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caste::Scout => write!(f, "scout"),
            Caste::Worker => write!(f, "worker"),
            Caste::Soldier => write!(f, "soldier"),
        }
    }
}

/// Lifecycle state of a task.
///
/// `pending -> claimed -> active -> {done | failed}`, with
/// `active -> blocked -> pending` around file-scope conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Active,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Highest-urgency priority a task can carry.
pub const PRIORITY_MIN: u8 = 1;
/// Lowest-urgency priority a task can carry.
pub const PRIORITY_MAX: u8 = 5;
/// Priority assigned when a declaration omits one.
pub const PRIORITY_DEFAULT: u8 = 3;

/// Unit of work with a file scope, priority, and status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub caste: Caste,
    pub status: TaskStatus,
    /// 1 is the most urgent.
    pub priority: u8,
    /// File scope. Never changes after creation.
    #[serde(default)]
    pub files: Vec<String>,
    /// Extra context carried from the declaring ant (merged by quorum).
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub spawned_tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<String>, caste: Caste, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            description: String::new(),
            caste,
            status: TaskStatus::Pending,
            priority: PRIORITY_DEFAULT,
            files: Vec::new(),
            context: None,
            claimed_by: None,
            result: None,
            error: None,
            spawned_tasks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority, clamped into `1..=5`.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
        self
    }

    pub fn files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// The file scope as an ordered set.
    pub fn file_set(&self) -> BTreeSet<&str> {
        self.files.iter().map(String::as_str).collect()
    }

    /// Whether this task's file scope intersects `files`.
    pub fn overlaps<'a, I>(&self, files: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mine = self.file_set();
        files.into_iter().any(|f| mine.contains(f.as_str()))
    }

    /// Return an interrupted task to the queue.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.claimed_by = None;
        self.started_at = None;
    }

    /// Record a terminal outcome.
    pub fn finish(&mut self, success: bool, text: impl Into<String>) {
        let text = text.into();
        if success {
            self.status = TaskStatus::Done;
            self.result = Some(text);
        } else {
            self.status = TaskStatus::Failed;
            self.error = Some(text);
        }
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caste_parse_lenient() {
        assert_eq!(Caste::parse_lenient("Scout"), Caste::Scout);
        assert_eq!(Caste::parse_lenient("reviewer"), Caste::Soldier);
        assert_eq!(Caste::parse_lenient("executor"), Caste::Worker);
        assert_eq!(Caste::parse_lenient("banana"), Caste::Worker);
    }

    #[test]
    fn test_priority_is_clamped() {
        assert_eq!(Task::new("t", Caste::Worker, "x").priority(0).priority, 1);
        assert_eq!(Task::new("t", Caste::Worker, "x").priority(9).priority, 5);
    }

    #[test]
    fn test_overlaps() {
        let task = Task::new("t", Caste::Worker, "x").files(["a.rs", "b.rs"]);
        let other = vec!["b.rs".to_string()];
        let disjoint = vec!["c.rs".to_string()];
        assert!(task.overlaps(&other));
        assert!(!task.overlaps(&disjoint));
    }

    #[test]
    fn test_requeue_clears_claim() {
        let mut task = Task::new("t", Caste::Worker, "x");
        task.status = TaskStatus::Active;
        task.claimed_by = Some("ant-1".into());
        task.started_at = Some(Utc::now());
        task.requeue();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_by.is_none());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
    }
}
