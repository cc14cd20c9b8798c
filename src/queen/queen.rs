// ABOUTME: The queen - drives a colony through its phases with adaptive dispatch waves.
// ABOUTME: Owns scheduling only; every state change goes through the nest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::classify::classify_error;
use super::observer::{ColonyObserver, NoopObserver};
use super::quorum::quorum_merge;
use crate::concurrency::{LoadProbe, SystemLoadProbe, adapt};
use crate::config::{ColonyRequest, QueenConfig, SpawnerConfig};
use crate::error::{ColonyError, NestError};
use crate::model::{
    Ant, Caste, Colony, ColonyMetrics, ColonyPatch, ColonyStatus, ConcurrencyConfig, IdGenerator,
    LoadSample, PRIORITY_MIN, Task, TaskStatus,
};
use crate::nest::{LockSettings, Nest};
use crate::spawner::{Launcher, ProcessLauncher, SpawnOutcome, Spawner, WorkerEvent};

/// Title of the review task the queen synthesizes after the working phase.
pub const REVIEW_TITLE: &str = "Review the colony's changes";

/// Founds, resumes and schedules colonies.
///
/// A queen is reusable: each [`Queen::run`] or [`Queen::resume`] call opens
/// its own nest and keeps no state between calls. The launcher, load probe
/// and observer are seams; the defaults launch real worker processes, read
/// host load and report nothing.
pub struct Queen {
    config: QueenConfig,
    spawner_config: SpawnerConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn LoadProbe>,
    observer: Arc<dyn ColonyObserver>,
    lock_settings: Option<LockSettings>,
}

impl Queen {
    pub fn new(config: QueenConfig, spawner_config: SpawnerConfig) -> Self {
        Self {
            config,
            spawner_config,
            launcher: Arc::new(ProcessLauncher::default()),
            probe: Arc::new(SystemLoadProbe),
            observer: Arc::new(NoopObserver),
            lock_settings: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ColonyObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = Some(settings);
        self
    }

    /// Found a colony for `request` and drive it to a terminal state.
    ///
    /// Returns the final colony with tasks and live pheromones. A cancelled
    /// run returns early with a non-terminal status and can be resumed.
    pub async fn run(&self, request: ColonyRequest) -> Result<Colony, ColonyError> {
        let colony_id = new_colony_id();
        let ids = Arc::new(IdGenerator::new());
        let max = request.max_ants.unwrap_or(self.config.max_ants).max(1);
        let min = self.config.min_ants.clamp(1, max);

        let mut colony = Colony::new(&colony_id, &request.goal, ConcurrencyConfig::new(min, max));
        colony.max_cost = request.max_cost;
        colony.model_overrides = request.model_overrides.clone();
        colony.tasks.push(seed_scout(&ids, &request.goal));

        let nest = Arc::new(self.open_nest(&request.working_dir, &colony_id));
        nest.initialize(&colony).await?;
        info!(colony = %colony_id, max_ants = max, "Colony founded");

        self.campaign(nest, ids, &request.working_dir, request.cancel)
            .drive(ColonyStatus::Scouting)
            .await
    }

    /// Pick up the newest unfinished colony under `working_dir`.
    ///
    /// Interrupted tasks go back to pending and the colony continues from
    /// its persisted phase.
    pub async fn resume(
        &self,
        working_dir: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<Colony, ColonyError> {
        let working_dir = working_dir.as_ref();
        let colony_id = Nest::find_resumable(working_dir)
            .ok_or_else(|| ColonyError::NothingToResume(working_dir.to_path_buf()))?;

        let nest = Arc::new(self.open_nest(working_dir, &colony_id));
        let colony = nest.resume().await?;
        info!(colony = %colony_id, phase = %colony.status, "Resuming colony");

        self.campaign(nest, Arc::new(IdGenerator::new()), working_dir, cancel)
            .drive(colony.status)
            .await
    }

    fn open_nest(&self, working_dir: &Path, colony_id: &str) -> Nest {
        let nest = Nest::open(working_dir, colony_id);
        match &self.lock_settings {
            Some(settings) => nest.with_lock_settings(*settings),
            None => nest,
        }
    }

    fn campaign(
        &self,
        nest: Arc<Nest>,
        ids: Arc<IdGenerator>,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Campaign {
        let observer = Arc::clone(&self.observer);
        let spawner = Spawner::new(
            Arc::clone(&nest),
            Arc::clone(&self.launcher),
            Arc::clone(&ids),
            self.spawner_config.clone(),
            PathBuf::from(working_dir),
        )
        .on_event(Arc::new(move |ant: &Ant, event: &WorkerEvent| {
            observer.on_progress(ant, event)
        }));

        Campaign {
            nest,
            spawner,
            ids,
            probe: Arc::clone(&self.probe),
            observer: Arc::clone(&self.observer),
            config: self.config.clone(),
            cancel,
            last_sample: None,
        }
    }
}

fn new_colony_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("colony-{}", &id[..12])
}

fn seed_scout(ids: &IdGenerator, goal: &str) -> Task {
    let headline: String = goal.lines().next().unwrap_or_default().chars().take(80).collect();
    Task::new(ids.task(), Caste::Scout, format!("Scout: {}", headline))
        .description(format!(
            "Explore the codebase and decompose this goal into concrete tasks:\n\n{}",
            goal
        ))
        .priority(PRIORITY_MIN)
}

/// Why a dispatch wave stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaveEnd {
    /// No pending or blocked task of the wave's caste is left.
    Drained,
    BudgetExceeded,
    Cancelled,
}

/// What one pass of the dispatch loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Dispatched,
    /// Nothing could be claimed; poll again shortly.
    Idle,
    /// The batch was rate limited; wait before the next one.
    Backoff(Duration),
    End(WaveEnd),
}

/// Exponential backoff between rate-limited batches.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    ceiling: Duration,
    last: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling: ceiling.max(initial),
            last: None,
        }
    }

    /// The next delay: `initial`, then doubling up to `ceiling`.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.last {
            Some(last) => (last * 2).min(self.ceiling),
            None => self.initial,
        };
        self.last = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

/// One colony being driven by a queen.
struct Campaign {
    nest: Arc<Nest>,
    spawner: Spawner,
    ids: Arc<IdGenerator>,
    probe: Arc<dyn LoadProbe>,
    observer: Arc<dyn ColonyObserver>,
    config: QueenConfig,
    cancel: CancellationToken,
    /// When the previous load sample was taken and how many tasks were done.
    last_sample: Option<(Instant, usize)>,
}

impl Campaign {
    /// Run the phases from `phase` onward.
    async fn drive(mut self, phase: ColonyStatus) -> Result<Colony, ColonyError> {
        if phase.is_terminal() {
            return self.full_colony();
        }

        if phase == ColonyStatus::Scouting {
            self.enter(ColonyStatus::Scouting).await?;
            let end = self.wave(Caste::Scout).await?;
            if end != WaveEnd::Drained {
                return self.halt(end).await;
            }
            if !self.has_work(|caste| caste != Caste::Scout) {
                warn!(colony = %self.nest.colony_id(), "Scouts declared no actionable tasks");
                return self.finish(ColonyStatus::Failed).await;
            }
        }

        if matches!(phase, ColonyStatus::Scouting | ColonyStatus::Working) {
            self.enter(ColonyStatus::Working).await?;
            let end = self.work().await?;
            if end != WaveEnd::Drained {
                return self.halt(end).await;
            }
        }

        let end = self.review().await?;
        if end != WaveEnd::Drained {
            return self.halt(end).await;
        }

        self.finish(ColonyStatus::Done).await
    }

    /// Worker waves: one, plus extra rounds while worker tasks remain.
    async fn work(&mut self) -> Result<WaveEnd, ColonyError> {
        let mut end = self.wave(Caste::Worker).await?;
        let mut rounds = 0;
        while end == WaveEnd::Drained
            && rounds < self.config.extra_work_rounds
            && self.has_work(|caste| caste == Caste::Worker)
        {
            rounds += 1;
            debug!(round = rounds, "Extra worker round");
            end = self.wave(Caste::Worker).await?;
        }
        Ok(end)
    }

    /// Review the finished work, then apply any fixes the review declared.
    async fn review(&mut self) -> Result<WaveEnd, ColonyError> {
        let tasks = self.nest.read_all_tasks();
        let reviewed = tasks
            .iter()
            .any(|t| t.caste == Caste::Soldier && t.parent_id.is_none());
        if !reviewed {
            if let Some(review) = self.review_task(&tasks) {
                info!(task = %review.id, files = review.files.len(), "Scheduling review");
                self.nest.write_task(&review)?;
            }
        }

        if !self.has_work(|caste| caste == Caste::Soldier) {
            return Ok(WaveEnd::Drained);
        }
        self.enter(ColonyStatus::Reviewing).await?;
        let end = self.wave(Caste::Soldier).await?;
        if end != WaveEnd::Drained {
            return Ok(end);
        }

        if self.has_work(|caste| caste == Caste::Worker) {
            info!("Applying review fixes");
            self.enter(ColonyStatus::Working).await?;
            return self.wave(Caste::Worker).await;
        }
        Ok(WaveEnd::Drained)
    }

    fn review_task(&self, tasks: &[Task]) -> Option<Task> {
        let done: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.caste == Caste::Worker && t.status == TaskStatus::Done)
            .collect();
        if done.is_empty() {
            return None;
        }
        let files: BTreeSet<&str> = done.iter().flat_map(|t| t.file_set()).collect();
        let summary: Vec<String> = done.iter().map(|t| format!("- {}", t.title)).collect();
        Some(
            Task::new(self.ids.task(), Caste::Soldier, REVIEW_TITLE)
                .description(format!(
                    "Review the changes made by these completed tasks and declare a worker \
                     task for every defect you find:\n{}",
                    summary.join("\n")
                ))
                .files(files)
                .priority(PRIORITY_MIN),
        )
    }

    /// Whether any pending or blocked task has a caste matching `wanted`.
    fn has_work(&self, wanted: impl Fn(Caste) -> bool) -> bool {
        self.nest.read_all_tasks().iter().any(|t| {
            wanted(t.caste) && matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked)
        })
    }

    // --- Dispatch ------------------------------------------------------

    /// Dispatch batches of `caste` tasks until none are left to run.
    async fn wave(&mut self, caste: Caste) -> Result<WaveEnd, ColonyError> {
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_ceiling());
        loop {
            if self.cancel.is_cancelled() {
                return Ok(WaveEnd::Cancelled);
            }
            let pause = match self.step(caste, &mut backoff).await {
                Ok(Step::Dispatched) => continue,
                Ok(Step::End(end)) => return Ok(end),
                Ok(Step::Idle) => self.config.idle_poll_interval(),
                Ok(Step::Backoff(delay)) => delay,
                Err(ColonyError::Nest(e)) if e.is_lock_timeout() => {
                    warn!(caste = %caste, error = %e, "Nest busy, retrying");
                    self.config.idle_poll_interval()
                }
                Err(e) => return Err(e),
            };
            if !self.pause(pause).await {
                return Ok(WaveEnd::Cancelled);
            }
        }
    }

    /// One batch: budget check, housekeeping, sampling, claiming, running.
    async fn step(&mut self, caste: Caste, backoff: &mut Backoff) -> Result<Step, ColonyError> {
        let colony = self.light_colony()?;
        if let Some(max) = colony.max_cost {
            let spent = colony.spent();
            if spent >= max {
                warn!(spent, max, "Budget exhausted");
                return Ok(Step::End(WaveEnd::BudgetExceeded));
            }
        }

        let tasks = self.tidy(caste)?;
        let pending = count(&tasks, caste, TaskStatus::Pending);
        if pending == 0 {
            return Ok(if count(&tasks, caste, TaskStatus::Blocked) == 0 {
                Step::End(WaveEnd::Drained)
            } else {
                Step::Idle
            });
        }

        let sample = self.sample(&colony, &tasks);
        let sampled = self.nest.record_sample(sample).await?;
        let next = adapt(&sampled, pending);
        if next.current != sampled.current || next.optimal != sampled.optimal {
            debug!(from = sampled.current, to = next.current, pending, "Adjusting concurrency");
            self.nest
                .update_colony(ColonyPatch::new().concurrency(next.clone()))
                .await?;
        }

        let slots = next.current.saturating_sub(colony.working_ants());
        if slots == 0 {
            return Ok(Step::Idle);
        }
        let batch = self.claim_batch(caste, slots, &tasks).await?;
        if batch.is_empty() {
            return Ok(Step::Idle);
        }

        let outcomes = self.run_batch(batch).await;
        self.settle_batch(&outcomes, backoff).await
    }

    /// Merge quorum duplicates and release blocked tasks whose files are
    /// free again. Returns the resulting task list.
    fn tidy(&self, caste: Caste) -> Result<Vec<Task>, ColonyError> {
        let tasks = self.nest.read_all_tasks();

        let merged = quorum_merge(&tasks);
        for task in &merged {
            self.nest.write_task(task)?;
        }
        if !merged.is_empty() {
            info!(changed = merged.len(), "Quorum merged duplicate tasks");
        }

        let busy = active_files(&tasks);
        let mut released = 0;
        for task in &tasks {
            if task.caste == caste && task.status == TaskStatus::Blocked && !task.overlaps(&busy) {
                let mut task = task.clone();
                task.status = TaskStatus::Pending;
                self.nest.write_task(&task)?;
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "Released blocked tasks");
        }

        if merged.is_empty() && released == 0 {
            Ok(tasks)
        } else {
            Ok(self.nest.read_all_tasks())
        }
    }

    fn sample(&mut self, colony: &Colony, tasks: &[Task]) -> LoadSample {
        let load = self.probe.sample();
        let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
        let now = Instant::now();
        let throughput = match self.last_sample {
            Some((at, before)) => {
                let minutes = now.duration_since(at).as_secs_f64() / 60.0;
                if minutes > 0.0 {
                    done.saturating_sub(before) as f64 / minutes
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_sample = Some((now, done));
        LoadSample {
            timestamp: Utc::now(),
            active: colony.concurrency.current,
            cpu_load: load.cpu_load,
            mem_free_mb: load.mem_free_mb,
            throughput,
        }
    }

    /// Claim up to `slots` tasks. A claimed task whose files overlap an
    /// active task, or one already in this batch, is marked blocked.
    async fn claim_batch(
        &self,
        caste: Caste,
        slots: usize,
        tasks: &[Task],
    ) -> Result<Vec<Task>, ColonyError> {
        let mut busy = active_files(tasks);
        let mut batch = Vec::new();
        for _ in 0..slots {
            let ant_id = self.ids.ant();
            let mut task = match self.nest.claim_next_task(caste, &ant_id).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) if e.is_lock_timeout() && !batch.is_empty() => {
                    warn!(error = %e, claimed = batch.len(), "Nest busy, running a partial batch");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if task.overlaps(&busy) {
                task.status = TaskStatus::Blocked;
                task.claimed_by = None;
                self.nest.write_task(&task)?;
                debug!(task = %task.id, "Task blocked on a file conflict");
                continue;
            }
            busy.extend(task.files.iter().cloned());
            batch.push(task);
        }
        Ok(batch)
    }

    async fn run_batch(&self, batch: Vec<Task>) -> Vec<SpawnOutcome> {
        info!(ants = batch.len(), caste = %batch[0].caste, "Dispatching batch");
        for task in &batch {
            self.observer.on_ant_spawned(task);
        }
        let spawner = &self.spawner;
        let runs = batch
            .into_iter()
            .map(|task| spawner.spawn(task, self.cancel.child_token()));
        let outcomes = join_all(runs).await;
        for outcome in &outcomes {
            self.observer.on_ant_finished(outcome);
        }
        outcomes
    }

    /// Record failure classes and metrics; throttle on a rate limit.
    async fn settle_batch(
        &self,
        outcomes: &[SpawnOutcome],
        backoff: &mut Backoff,
    ) -> Result<Step, ColonyError> {
        let colony = self.light_colony()?;
        let mut metrics = colony.metrics.clone();
        for outcome in outcomes.iter().filter(|o| o.task.status == TaskStatus::Failed) {
            let class = classify_error(&outcome.output);
            *metrics.error_classes.entry(class.to_string()).or_default() += 1;
            warn!(task = %outcome.task.id, class = %class, "Task failed");
        }

        let mut patch = ColonyPatch::new();
        let mut step = Step::Dispatched;
        if outcomes.iter().any(|o| o.rate_limited) {
            let mut concurrency = colony.concurrency.clone();
            concurrency.current = (concurrency.current / 2).max(concurrency.min);
            concurrency.last_rate_limit_at = Some(Utc::now());
            metrics.rate_limit_hits += 1;
            let delay = backoff.next_delay();
            warn!(
                concurrency = concurrency.current,
                backoff_secs = delay.as_secs(),
                "Rate limited, throttling"
            );
            self.observer.on_rate_limited(&concurrency, delay);
            patch = patch.concurrency(concurrency);
            step = Step::Backoff(delay);
        } else {
            backoff.reset();
        }

        let metrics = self.recompute(&metrics, &colony);
        self.nest.update_colony(patch.metrics(metrics.clone())).await?;
        self.observer.on_metrics(&metrics);
        Ok(step)
    }

    // --- Phases and outcomes ---------------------------------------------

    async fn enter(&self, status: ColonyStatus) -> Result<(), ColonyError> {
        self.nest.update_colony(ColonyPatch::new().status(status)).await?;
        info!(colony = %self.nest.colony_id(), phase = %status, "Phase");
        self.observer.on_phase(self.nest.colony_id(), status);
        Ok(())
    }

    /// Stop early: a terminal status for an exhausted budget, otherwise
    /// leave the colony resumable.
    async fn halt(&self, end: WaveEnd) -> Result<Colony, ColonyError> {
        match end {
            WaveEnd::BudgetExceeded => self.finish(ColonyStatus::BudgetExceeded).await,
            WaveEnd::Cancelled | WaveEnd::Drained => {
                let colony = self.light_colony()?;
                let metrics = self.recompute(&colony.metrics, &colony);
                self.nest
                    .update_colony(ColonyPatch::new().metrics(metrics))
                    .await?;
                info!(colony = %colony.id, phase = %colony.status, "Colony paused");
                self.full_colony()
            }
        }
    }

    async fn finish(&self, status: ColonyStatus) -> Result<Colony, ColonyError> {
        let colony = self.light_colony()?;
        let metrics = self.recompute(&colony.metrics, &colony);
        self.nest
            .update_colony(
                ColonyPatch::new()
                    .status(status)
                    .metrics(metrics.clone())
                    .finished_at(Utc::now()),
            )
            .await?;
        info!(
            colony = %colony.id,
            status = %status,
            done = metrics.tasks_done,
            failed = metrics.tasks_failed,
            cost = metrics.total_cost,
            "Colony finished"
        );
        self.observer.on_metrics(&metrics);
        self.observer.on_phase(&colony.id, status);

        let full = self.full_colony()?;
        self.observer.on_complete(&full);
        Ok(full)
    }

    fn recompute(&self, previous: &ColonyMetrics, colony: &Colony) -> ColonyMetrics {
        ColonyMetrics::recompute(
            previous,
            &self.nest.read_all_tasks(),
            &colony.ants,
            self.nest.read_all_pheromones().len(),
        )
    }

    fn light_colony(&self) -> Result<Colony, ColonyError> {
        self.nest
            .read_colony_light()
            .ok_or_else(|| NestError::ColonyNotFound(self.nest.colony_id().to_string()).into())
    }

    fn full_colony(&self) -> Result<Colony, ColonyError> {
        self.nest
            .read_colony_full()
            .ok_or_else(|| NestError::ColonyNotFound(self.nest.colony_id().to_string()).into())
    }

    /// Sleep for `duration`. Returns `false` when cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn count(tasks: &[Task], caste: Caste, status: TaskStatus) -> usize {
    tasks
        .iter()
        .filter(|t| t.caste == caste && t.status == status)
        .count()
}

fn active_files(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Active)
        .flat_map(|t| t.files.iter().cloned())
        .collect()
}
