// ABOUTME: Configuration types - the colony request, queen tuning and spawner setup.
// ABOUTME: Builder-style structs with defaults; serde-loadable except for cancellation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::model::Caste;

/// Environment variable overriding the worker executable.
pub const WORKER_BIN_ENV: &str = "COLONY_WORKER_BIN";
/// Environment variable overriding the default worker model.
pub const WORKER_MODEL_ENV: &str = "COLONY_WORKER_MODEL";

/// What the invoker asks the queen to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColonyRequest {
    /// Goal text handed to the first scout.
    pub goal: String,

    /// Directory the ants work in; the nest lives beneath it.
    pub working_dir: PathBuf,

    /// Upper bound on concurrent ants. Falls back to the queen's default.
    #[serde(default)]
    pub max_ants: Option<usize>,

    /// Stop with `budget_exceeded` once cumulative cost reaches this.
    #[serde(default)]
    pub max_cost: Option<f64>,

    /// Model per caste, overriding the spawner's default.
    #[serde(default)]
    pub model_overrides: BTreeMap<Caste, String>,

    /// Cooperative cancellation for the dispatch loop and in-flight ants.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl ColonyRequest {
    pub fn new(goal: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            goal: goal.into(),
            working_dir: working_dir.into(),
            max_ants: None,
            max_cost: None,
            model_overrides: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn max_ants(mut self, max: usize) -> Self {
        self.max_ants = Some(max);
        self
    }

    pub fn max_cost(mut self, max: f64) -> Self {
        self.max_cost = Some(max);
        self
    }

    pub fn model(mut self, caste: Caste, model: impl Into<String>) -> Self {
        self.model_overrides.insert(caste, model.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenConfig {
    pub min_ants: usize,
    /// Used when the request does not set `max_ants`.
    pub max_ants: usize,
    /// First backoff after a rate-limited batch.
    pub backoff_initial_secs: u64,
    pub backoff_ceiling_secs: u64,
    /// Sleep when no concurrency slot is free.
    pub idle_poll_ms: u64,
    /// Extra worker waves while worker tasks remain.
    pub extra_work_rounds: usize,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            min_ants: 1,
            max_ants: 4,
            backoff_initial_secs: 15,
            backoff_ceiling_secs: 60,
            idle_poll_ms: 500,
            extra_work_rounds: 3,
        }
    }
}

impl QueenConfig {
    pub fn min_ants(mut self, min: usize) -> Self {
        self.min_ants = min;
        self
    }

    pub fn max_ants(mut self, max: usize) -> Self {
        self.max_ants = max;
        self
    }

    pub fn idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// How ants are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Worker executable.
    pub program: String,
    pub default_model: String,
    /// Appended after the standard flags, before the instruction.
    pub extra_args: Vec<String>,
    /// Tool allowlist per caste. A caste without an entry gets no flag.
    pub allowed_tools: BTreeMap<Caste, Vec<String>>,
    /// Pheromones included in each prompt.
    pub pheromone_limit: usize,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        let read_only = ["Read", "Glob", "Grep", "LS"];
        let mut allowed_tools = BTreeMap::new();
        allowed_tools.insert(Caste::Scout, read_only.iter().map(|t| t.to_string()).collect());
        allowed_tools.insert(Caste::Soldier, read_only.iter().map(|t| t.to_string()).collect());
        allowed_tools.insert(
            Caste::Worker,
            ["Read", "Glob", "Grep", "LS", "Edit", "Write", "Bash"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        );
        Self {
            program: "claude".to_string(),
            default_model: "sonnet".to_string(),
            extra_args: Vec::new(),
            allowed_tools,
            pheromone_limit: 12,
        }
    }
}

impl SpawnerConfig {
    /// Defaults, with the program and model taken from the environment when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(program) = std::env::var(WORKER_BIN_ENV).ok().filter(|v| !v.is_empty()) {
            config.program = program;
        }
        if let Some(model) = std::env::var(WORKER_MODEL_ENV).ok().filter(|v| !v.is_empty()) {
            config.default_model = model;
        }
        config
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn allowed_tools(mut self, caste: Caste, tools: Vec<String>) -> Self {
        self.allowed_tools.insert(caste, tools);
        self
    }
}
