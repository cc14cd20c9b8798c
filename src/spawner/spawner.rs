// ABOUTME: Ant lifecycle - runs one worker for one claimed task and settles the outcome.
// ABOUTME: Never raises: launch and store failures become failed outcomes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{RunTally, WorkerEvent};
use super::process::{LaunchEvent, LaunchSpec, Launcher, WorkerRun};
use super::prompt::{PromptFile, instruction, system_prompt};
use crate::config::SpawnerConfig;
use crate::error::ColonyError;
use crate::model::{Ant, AntStatus, Caste, Colony, IdGenerator, Task, TaskStatus};
use crate::nest::Nest;
use crate::parser::{PheromoneDraft, extract_pheromones, parse_output};

/// Substrings (lowercase) that mark a failed run as rate limited.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
];

/// Best-effort rate-limit detection. False negatives are expected.
pub fn is_rate_limited(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Called for every decoded event while an ant runs.
pub type ProgressCallback = Arc<dyn Fn(&Ant, &WorkerEvent) + Send + Sync>;

/// Result of one ant run.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    /// The task as last written.
    pub task: Task,
    pub ant: Ant,
    pub success: bool,
    /// The task went back to pending because the worker was rate limited.
    pub rate_limited: bool,
    /// The task went back to pending because the run was cancelled.
    pub cancelled: bool,
    /// Child tasks declared by the ant.
    pub new_tasks: Vec<Task>,
    /// Final report, or the failure text.
    pub output: String,
}

/// Spawns ants for claimed tasks.
pub struct Spawner {
    nest: Arc<Nest>,
    launcher: Arc<dyn Launcher>,
    ids: Arc<IdGenerator>,
    config: SpawnerConfig,
    working_dir: PathBuf,
    on_event: Option<ProgressCallback>,
}

impl Spawner {
    pub fn new(
        nest: Arc<Nest>,
        launcher: Arc<dyn Launcher>,
        ids: Arc<IdGenerator>,
        config: SpawnerConfig,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            nest,
            launcher,
            ids,
            config,
            working_dir: working_dir.into(),
            on_event: None,
        }
    }

    pub fn on_event(mut self, callback: ProgressCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Model for `caste`: the colony's override, else the configured default.
    pub fn resolve_model(&self, caste: Caste, colony: Option<&Colony>) -> String {
        colony
            .and_then(|c| c.model_overrides.get(&caste))
            .cloned()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// The command line for one run.
    pub fn launch_spec(&self, task: &Task, model: &str, prompt_file: &Path) -> LaunchSpec {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--model".into(),
            model.into(),
        ];
        if let Some(tools) = self.config.allowed_tools.get(&task.caste).filter(|t| !t.is_empty()) {
            args.push("--allowedTools".into());
            args.push(tools.join(","));
        }
        args.push("--append-system-prompt-file".into());
        args.push(prompt_file.display().to_string());
        args.extend(self.config.extra_args.iter().cloned());
        args.push("--".into());
        args.push(instruction(task));

        LaunchSpec {
            program: self.config.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
        }
    }

    /// Run one ant for a claimed task and record everything it produced.
    ///
    /// The ant id is the task's claimant when set. Rate-limited and
    /// cancelled runs return the task to pending; other failures mark it
    /// failed and leave a repellent.
    pub async fn spawn(&self, mut task: Task, cancel: CancellationToken) -> SpawnOutcome {
        let ant_id = task.claimed_by.clone().unwrap_or_else(|| self.ids.ant());
        let mut ant = Ant::new(ant_id, task.caste, &task.id);
        ant.status = AntStatus::Working;
        task.status = TaskStatus::Active;
        task.claimed_by = Some(ant.id.clone());
        task.started_at = Some(Utc::now());

        let result = match self.publish_start(&task, &ant).await {
            Ok(()) => self.execute(&task, &mut ant, cancel).await,
            Err(e) => Err(e),
        };
        match result {
            Ok((run, tally)) => self.settle(task, ant, run, tally).await,
            Err(e) => self.settle_error(task, ant, e).await,
        }
    }

    async fn publish_start(&self, task: &Task, ant: &Ant) -> Result<(), ColonyError> {
        self.nest.write_task(task)?;
        self.nest.update_ant(ant).await?;
        Ok(())
    }

    async fn execute(
        &self,
        task: &Task,
        ant: &mut Ant,
        cancel: CancellationToken,
    ) -> Result<(WorkerRun, RunTally), ColonyError> {
        let colony = self.nest.read_colony_light();
        let goal = colony.as_ref().map(|c| c.goal.clone()).unwrap_or_default();
        let model = self.resolve_model(task.caste, colony.as_ref());
        let trail = self
            .nest
            .pheromone_context(&task.files, self.config.pheromone_limit);

        let prompt = PromptFile::write(&system_prompt(task, &goal, &trail))?;
        let spec = self.launch_spec(task, &model, prompt.path());
        info!(ant = %ant.id, task = %task.id, caste = %task.caste, model = %model, "Spawning ant");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = ant.clone();
        let drain = async {
            let mut tally = RunTally::default();
            let mut pid = None;
            while let Some(event) = rx.recv().await {
                match event {
                    LaunchEvent::Started { pid: started } => {
                        pid = Some(started);
                        let mut published = running.clone();
                        published.pid = Some(started);
                        if let Err(e) = self.nest.update_ant(&published).await {
                            warn!(ant = %running.id, error = %e, "Could not publish ant pid");
                        }
                    }
                    LaunchEvent::Event(event) => {
                        if let Some(callback) = &self.on_event {
                            callback(&running, &event);
                        }
                        tally.apply(&event);
                    }
                }
            }
            (tally, pid)
        };

        let (run, (tally, pid)) = tokio::join!(self.launcher.launch(&spec, tx, cancel), drain);
        drop(prompt);
        ant.pid = pid.or(ant.pid);
        ant.usage = tally.usage.clone();
        Ok((run?, tally))
    }

    /// Classify a finished run. Rate-limit markers are only consulted once
    /// the run has failed; a successful report that mentions one stays done.
    async fn settle(&self, mut task: Task, mut ant: Ant, run: WorkerRun, tally: RunTally) -> SpawnOutcome {
        let report = tally.report();
        let mut new_tasks = Vec::new();
        let mut rate_limited = false;
        let mut success = false;
        let output;

        if run.cancelled {
            task.requeue();
            ant.finish(AntStatus::Failed);
            info!(ant = %ant.id, task = %task.id, "Ant cancelled, task requeued");
            output = report;
        } else if run.succeeded() && !tally.is_error {
            let parsed = parse_output(&report, &task, true);
            for declared in parsed.tasks {
                new_tasks.push(declared.into_task(self.ids.task(), &task.id));
            }
            task.spawned_tasks = new_tasks.iter().map(|t| t.id.clone()).collect();
            task.finish(true, report.clone());
            ant.finish(AntStatus::Done);
            success = true;

            for child in &new_tasks {
                if let Err(e) = self.nest.write_task(child) {
                    warn!(task = %child.id, error = %e, "Could not write declared task");
                }
            }
            self.deposit(parsed.pheromones, &ant);
            info!(
                ant = %ant.id,
                task = %task.id,
                declared = new_tasks.len(),
                cost = ant.usage.cost,
                "Ant finished"
            );
            output = report;
        } else if is_rate_limited(&run.stderr) || is_rate_limited(&report) {
            rate_limited = true;
            task.requeue();
            ant.finish(AntStatus::Failed);
            warn!(ant = %ant.id, task = %task.id, "Ant was rate limited, task requeued");
            output = failure_text(&run, &report);
        } else {
            let error = failure_text(&run, &report);
            self.deposit(extract_pheromones(&error, &task, false), &ant);
            task.finish(false, error.clone());
            ant.finish(AntStatus::Failed);
            warn!(ant = %ant.id, task = %task.id, exit_code = ?run.exit_code, "Ant failed");
            output = error;
        }

        self.publish_end(&task, &ant).await;
        SpawnOutcome {
            task,
            ant,
            success,
            rate_limited,
            cancelled: run.cancelled,
            new_tasks,
            output,
        }
    }

    async fn settle_error(&self, mut task: Task, mut ant: Ant, error: ColonyError) -> SpawnOutcome {
        let message = error.to_string();
        warn!(ant = %ant.id, task = %task.id, error = %message, "Ant could not run");
        self.deposit(extract_pheromones(&message, &task, false), &ant);
        task.finish(false, message.clone());
        ant.finish(AntStatus::Failed);
        self.publish_end(&task, &ant).await;
        SpawnOutcome {
            task,
            ant,
            success: false,
            rate_limited: false,
            cancelled: false,
            new_tasks: Vec::new(),
            output: message,
        }
    }

    fn deposit(&self, drafts: Vec<PheromoneDraft>, ant: &Ant) {
        for draft in drafts {
            let pheromone = draft.into_pheromone(self.ids.pheromone(), ant);
            if let Err(e) = self.nest.drop_pheromone(&pheromone) {
                warn!(ant = %ant.id, error = %e, "Could not deposit pheromone");
            }
        }
    }

    async fn publish_end(&self, task: &Task, ant: &Ant) {
        if let Err(e) = self.nest.write_task(task) {
            warn!(task = %task.id, error = %e, "Could not write task outcome");
        }
        if let Err(e) = self.nest.update_ant(ant).await {
            warn!(ant = %ant.id, error = %e, "Could not publish ant outcome");
        }
    }
}

/// Report and stderr of a failed run, or a note on how it exited when both are empty.
fn failure_text(run: &WorkerRun, report: &str) -> String {
    let parts: Vec<&str> = [report.trim(), run.stderr.trim()]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts.join("\n");
    }
    match run.exit_code {
        Some(code) => format!("Worker exited with code {}", code),
        None => "Worker was terminated by a signal".to_string(),
    }
}
