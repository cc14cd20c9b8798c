// ABOUTME: Colony record - the aggregate root of one run toward one goal.
// ABOUTME: Also holds concurrency telemetry, metrics, and the update patch type.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ant::{Ant, AntStatus};
use super::pheromone::Pheromone;
use super::task::{Caste, Task, TaskStatus};

/// Number of load samples retained in the concurrency history.
pub const SAMPLE_WINDOW: usize = 30;

/// Phase (or terminal outcome) of a colony.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColonyStatus {
    Scouting,
    Working,
    Reviewing,
    Done,
    Failed,
    BudgetExceeded,
}

impl ColonyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ColonyStatus::Done | ColonyStatus::Failed | ColonyStatus::BudgetExceeded
        )
    }
}

impl fmt::Display for ColonyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColonyStatus::Scouting => "scouting",
            ColonyStatus::Working => "working",
            ColonyStatus::Reviewing => "reviewing",
            ColonyStatus::Done => "done",
            ColonyStatus::Failed => "failed",
            ColonyStatus::BudgetExceeded => "budget_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// One observation of system load between dispatch batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub timestamp: DateTime<Utc>,
    /// Parallelism in effect when the sample was taken.
    pub active: usize,
    /// Load average normalized by CPU count; 1.0 means fully busy.
    pub cpu_load: f64,
    pub mem_free_mb: u64,
    /// Tasks completed per minute since the previous sample.
    pub throughput: f64,
}

/// Adaptive parallelism state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    /// Learned throughput knee.
    pub optimal: usize,
    #[serde(default)]
    pub history: Vec<LoadSample>,
    #[serde(default)]
    pub last_rate_limit_at: Option<DateTime<Utc>>,
}

impl ConcurrencyConfig {
    /// Create a config for `min..=max` ants. `max` is raised to `min` if lower.
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let half = max.div_ceil(2).max(min);
        Self {
            current: min,
            min,
            max,
            optimal: half,
            history: Vec::new(),
            last_rate_limit_at: None,
        }
    }

    /// Append a sample, keeping only the newest [`SAMPLE_WINDOW`].
    pub fn push_sample(&mut self, sample: LoadSample) {
        self.history.push(sample);
        if self.history.len() > SAMPLE_WINDOW {
            let excess = self.history.len() - SAMPLE_WINDOW;
            self.history.drain(..excess);
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self::new(1, 4)
    }
}

/// Aggregate counters recomputed by the queen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColonyMetrics {
    pub tasks_total: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    pub tasks_pending: usize,
    pub ants_spawned: usize,
    pub pheromones_live: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub rate_limit_hits: u32,
    /// Failed-task counts keyed by error class.
    #[serde(default)]
    pub error_classes: BTreeMap<String, u32>,
}

impl ColonyMetrics {
    /// Recompute task and usage counters. Rate-limit hits and error classes
    /// are carried over from `previous`.
    pub fn recompute(previous: &ColonyMetrics, tasks: &[Task], ants: &[Ant], live: usize) -> Self {
        let mut metrics = ColonyMetrics {
            tasks_total: tasks.len(),
            rate_limit_hits: previous.rate_limit_hits,
            error_classes: previous.error_classes.clone(),
            pheromones_live: live,
            ants_spawned: ants.len(),
            ..Default::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Done => metrics.tasks_done += 1,
                TaskStatus::Failed => metrics.tasks_failed += 1,
                TaskStatus::Pending | TaskStatus::Blocked => metrics.tasks_pending += 1,
                _ => {}
            }
        }
        for ant in ants {
            metrics.input_tokens += ant.usage.input_tokens;
            metrics.output_tokens += ant.usage.output_tokens;
            metrics.total_cost += ant.usage.cost;
        }
        metrics
    }
}

/// Aggregate root for one colony run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Colony {
    pub id: String,
    pub goal: String,
    pub status: ColonyStatus,
    /// Populated on full reads; task files are the source of truth.
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub ants: Vec<Ant>,
    /// Populated on full reads; the pheromone log is the source of truth.
    #[serde(default)]
    pub pheromones: Vec<Pheromone>,
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub metrics: ColonyMetrics,
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub model_overrides: BTreeMap<Caste, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Colony {
    /// Create a colony in the scouting phase.
    pub fn new(id: impl Into<String>, goal: impl Into<String>, concurrency: ConcurrencyConfig) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            status: ColonyStatus::Scouting,
            tasks: Vec::new(),
            ants: Vec::new(),
            pheromones: Vec::new(),
            concurrency,
            metrics: ColonyMetrics::default(),
            max_cost: None,
            model_overrides: BTreeMap::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Cumulative cost of every ant spawned so far.
    pub fn spent(&self) -> f64 {
        self.ants.iter().map(|a| a.usage.cost).sum()
    }

    pub fn working_ants(&self) -> usize {
        self.ants
            .iter()
            .filter(|a| a.status == AntStatus::Working)
            .count()
    }

    /// Whether the colony can be picked up again after a crash.
    pub fn is_resumable(&self) -> bool {
        !self.status.is_terminal() && self.finished_at.is_none()
    }
}

/// The restricted set of colony fields that may be updated after creation.
#[derive(Debug, Clone, Default)]
pub struct ColonyPatch {
    pub status: Option<ColonyStatus>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub metrics: Option<ColonyMetrics>,
    pub ants: Option<Vec<Ant>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ColonyPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ColonyStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn metrics(mut self, metrics: ColonyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ants(mut self, ants: Vec<Ant>) -> Self {
        self.ants = Some(ants);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Apply the patch onto a colony record.
    pub fn apply(self, colony: &mut Colony) {
        if let Some(status) = self.status {
            colony.status = status;
        }
        if let Some(concurrency) = self.concurrency {
            colony.concurrency = concurrency;
        }
        if let Some(metrics) = self.metrics {
            colony.metrics = metrics;
        }
        if let Some(ants) = self.ants {
            colony.ants = ants;
        }
        if let Some(at) = self.finished_at {
            colony.finished_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> LoadSample {
        LoadSample {
            timestamp: Utc::now(),
            active: n,
            cpu_load: 0.1,
            mem_free_mb: 4096,
            throughput: n as f64,
        }
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let mut cfg = ConcurrencyConfig::new(1, 8);
        for i in 0..(SAMPLE_WINDOW + 5) {
            cfg.push_sample(sample(i));
        }
        assert_eq!(cfg.history.len(), SAMPLE_WINDOW);
        assert_eq!(cfg.history[0].active, 5);
    }

    #[test]
    fn test_new_config_normalizes_bounds() {
        let cfg = ConcurrencyConfig::new(3, 2);
        assert_eq!(cfg.min, 3);
        assert_eq!(cfg.max, 3);
        assert_eq!(cfg.current, 3);
    }

    #[test]
    fn test_budget_exceeded_serializes_snake_case() {
        let json = serde_json::to_string(&ColonyStatus::BudgetExceeded).unwrap();
        assert_eq!(json, "\"budget_exceeded\"");
        assert!(ColonyStatus::BudgetExceeded.is_terminal());
        assert!(!ColonyStatus::Reviewing.is_terminal());
    }

    #[test]
    fn test_patch_only_touches_given_fields() {
        let mut colony = Colony::new("c", "goal", ConcurrencyConfig::default());
        ColonyPatch::new().status(ColonyStatus::Working).apply(&mut colony);
        assert_eq!(colony.status, ColonyStatus::Working);
        assert_eq!(colony.goal, "goal");
        assert!(colony.finished_at.is_none());
    }
}
