// ABOUTME: Ant record - one spawned worker process attempt for one task.
// ABOUTME: Owned by the spawner while running, published into the colony record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Caste;

/// Lifecycle state of an ant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntStatus {
    Idle,
    Working,
    Done,
    Failed,
}

impl fmt::Display for AntStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AntStatus::Idle => write!(f, "idle"),
            AntStatus::Working => write!(f, "working"),
            AntStatus::Done => write!(f, "done"),
            AntStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Resource usage accumulated by one ant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AntUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Monetary cost in USD.
    pub cost: f64,
    pub turns: u32,
}

/// One worker process attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ant {
    pub id: String,
    pub caste: Caste,
    pub status: AntStatus,
    pub task_id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub usage: AntUsage,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Ant {
    /// Create an idle ant bound to a task.
    pub fn new(id: impl Into<String>, caste: Caste, task_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            caste,
            status: AntStatus::Idle,
            task_id: task_id.into(),
            pid: None,
            usage: AntUsage::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move the ant to a terminal status.
    pub fn finish(&mut self, status: AntStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
