// ABOUTME: The nest - durable, lock-coordinated store for one colony's state.
// ABOUTME: Sole writer of the colony record, task files and pheromone trail.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use super::cache::TaskCache;
use super::files::{read_json, remove_interrupted_writes, write_json_atomic};
use super::lock::{LOCK_STALE_AFTER, LockSettings, NestLock};
use super::trail::{PheromoneTrail, digest};
use crate::error::NestError;
use crate::model::{
    Ant, AntStatus, Caste, Colony, ColonyPatch, ConcurrencyConfig, LoadSample, Pheromone, Task,
    TaskStatus,
};
use crate::pheromone::{PheromoneIndex, rank};

/// Directory under a working directory that holds every colony's nest.
pub const NEST_ROOT: &str = ".ant-colony";

const COLONY_FILE: &str = "colony.json";
const TRAIL_FILE: &str = "pheromones.jsonl";
const LOCK_FILE: &str = "nest.lock";
const TASKS_DIR: &str = "tasks";

/// Path of the nest directory for `colony_id` under `working_dir`.
pub fn nest_dir(working_dir: &Path, colony_id: &str) -> PathBuf {
    working_dir.join(NEST_ROOT).join(colony_id)
}

/// On-disk coordination store for one colony.
///
/// Layout under `<working_dir>/.ant-colony/<colony_id>/`:
///
/// ```text
/// colony.json       colony record without tasks and pheromones
/// pheromones.jsonl  append-only pheromone trail
/// nest.lock         advisory lock, "<pid>:<millis>"
/// tasks/<id>.json   one file per task
/// ```
///
/// Multi-field mutations and claims run under [`NestLock`]. Single-file
/// writes are atomic renames. Missing or corrupt files read as absent.
pub struct Nest {
    dir: PathBuf,
    colony_id: String,
    lock: NestLock,
    tasks: Mutex<TaskCache>,
    colony: Mutex<Option<Colony>>,
    trail: PheromoneTrail,
    rng: Mutex<StdRng>,
}

impl Nest {
    /// Open the nest for `colony_id`. Nothing touches the disk until the
    /// first read or write.
    pub fn open(working_dir: impl AsRef<Path>, colony_id: impl Into<String>) -> Self {
        let colony_id = colony_id.into();
        let dir = nest_dir(working_dir.as_ref(), &colony_id);
        Self {
            lock: NestLock::new(dir.join(LOCK_FILE)),
            trail: PheromoneTrail::new(dir.join(TRAIL_FILE)),
            tasks: Mutex::new(TaskCache::new()),
            colony: Mutex::new(None),
            rng: Mutex::new(StdRng::from_os_rng()),
            colony_id,
            dir,
        }
    }

    /// Replace the lock timings.
    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock = NestLock::with_settings(self.dir.join(LOCK_FILE), settings);
        self
    }

    /// Seed the selection randomness, for reproducible claim order.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn colony_id(&self) -> &str {
        &self.colony_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn colony_path(&self) -> PathBuf {
        self.dir.join(COLONY_FILE)
    }

    fn tasks_dir(&self) -> PathBuf {
        self.dir.join(TASKS_DIR)
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{}.json", id))
    }

    // --- Colony record -------------------------------------------------

    /// Create the on-disk layout and write the colony and its initial tasks.
    pub async fn initialize(&self, colony: &Colony) -> Result<(), NestError> {
        fs::create_dir_all(self.tasks_dir())?;
        let _guard = self.lock.acquire().await?;

        for task in &colony.tasks {
            write_json_atomic(&self.task_path(&task.id), task)?;
        }
        self.store_colony(colony)?;
        self.tasks.lock().replace_all(colony.tasks.clone());
        self.trail.reset();

        info!(colony = %colony.id, dir = %self.dir.display(), tasks = colony.tasks.len(), "Nest initialized");
        Ok(())
    }

    /// The cached colony record, loaded from disk on first use. Task and
    /// pheromone lists are left empty.
    pub fn read_colony_light(&self) -> Option<Colony> {
        let mut cached = self.colony.lock();
        if cached.is_none() {
            *cached = read_json(&self.colony_path());
        }
        cached.clone()
    }

    /// The colony record with the current task list and live pheromones.
    pub fn read_colony_full(&self) -> Option<Colony> {
        let mut colony = self.read_colony_light()?;
        colony.tasks = self.read_all_tasks();
        colony.pheromones = self.read_all_pheromones();
        Some(colony)
    }

    /// Apply `patch` to the freshest on-disk colony record under the lock.
    pub async fn update_colony(&self, patch: ColonyPatch) -> Result<Colony, NestError> {
        let _guard = self.lock.acquire().await?;
        let mut colony = self.load_colony_for_update()?;
        patch.apply(&mut colony);
        self.store_colony(&colony)?;
        Ok(colony)
    }

    /// Append a load sample to the concurrency history under the lock.
    pub async fn record_sample(&self, sample: LoadSample) -> Result<ConcurrencyConfig, NestError> {
        let _guard = self.lock.acquire().await?;
        let mut colony = self.load_colony_for_update()?;
        colony.concurrency.push_sample(sample);
        self.store_colony(&colony)?;
        Ok(colony.concurrency)
    }

    /// Insert or replace an ant in the colony record under the lock.
    pub async fn update_ant(&self, ant: &Ant) -> Result<(), NestError> {
        let _guard = self.lock.acquire().await?;
        let mut colony = self.load_colony_for_update()?;
        match colony.ants.iter_mut().find(|a| a.id == ant.id) {
            Some(existing) => *existing = ant.clone(),
            None => colony.ants.push(ant.clone()),
        }
        self.store_colony(&colony)?;
        Ok(())
    }

    fn load_colony_for_update(&self) -> Result<Colony, NestError> {
        read_json::<Colony>(&self.colony_path())
            .or_else(|| self.colony.lock().clone())
            .ok_or_else(|| NestError::ColonyNotFound(self.colony_id.clone()))
    }

    fn store_colony(&self, colony: &Colony) -> Result<(), NestError> {
        let mut light = colony.clone();
        light.tasks.clear();
        light.pheromones.clear();
        write_json_atomic(&self.colony_path(), &light)?;
        *self.colony.lock() = Some(light);
        Ok(())
    }

    // --- Tasks ---------------------------------------------------------

    /// Atomically write one task file and update the cache.
    pub fn write_task(&self, task: &Task) -> Result<(), NestError> {
        write_json_atomic(&self.task_path(&task.id), task)?;
        self.tasks.lock().upsert(task.clone());
        Ok(())
    }

    /// One task, from the cache when present, otherwise from disk.
    pub fn read_task(&self, id: &str) -> Option<Task> {
        if let Some(task) = self.tasks.lock().get(id) {
            return Some(task.clone());
        }
        let task: Task = read_json(&self.task_path(id))?;
        self.tasks.lock().upsert(task.clone());
        Some(task)
    }

    /// Every task in creation order. Scans the task directory only while the
    /// cache is unpopulated.
    pub fn read_all_tasks(&self) -> Vec<Task> {
        {
            let cache = self.tasks.lock();
            if cache.is_populated() {
                return cache.all();
            }
        }
        self.refresh_tasks()
    }

    /// Rescan the task directory and replace the cache wholesale.
    pub fn refresh_tasks(&self) -> Vec<Task> {
        let tasks = self.scan_tasks();
        let mut cache = self.tasks.lock();
        cache.replace_all(tasks);
        cache.all()
    }

    fn scan_tasks(&self) -> Vec<Task> {
        let entries = match fs::read_dir(self.tasks_dir()) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!(dir = %self.tasks_dir().display(), error = %e, "Cannot list tasks");
                }
                return Vec::new();
            }
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| read_json::<Task>(&path))
            .collect()
    }

    /// Transition `pending -> claimed` under the lock. Returns `false` when
    /// the task is missing or not pending.
    pub async fn claim_task(&self, id: &str, claimant: &str) -> Result<bool, NestError> {
        let _guard = self.lock.acquire().await?;
        let Some(mut task) = read_json::<Task>(&self.task_path(id)) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            self.tasks.lock().upsert(task);
            return Ok(false);
        }
        self.mark_claimed(&mut task, claimant)?;
        Ok(true)
    }

    /// Pick and claim the best pending task of `caste` in one lock hold.
    ///
    /// Candidates are ranked by priority and pheromone score with
    /// epsilon-greedy exploration. Each is re-read from disk before the
    /// claim so that a task taken by another process is skipped.
    pub async fn claim_next_task(&self, caste: Caste, claimant: &str) -> Result<Option<Task>, NestError> {
        let _guard = self.lock.acquire().await?;

        let candidates: Vec<Task> = self
            .read_all_tasks()
            .into_iter()
            .filter(|t| t.caste == caste && t.status == TaskStatus::Pending)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let index = self.pheromone_index();
        let ranked = {
            let mut rng = self.rng.lock();
            rank(candidates, &index, &mut *rng)
        };

        for candidate in ranked {
            let Some(mut fresh) = read_json::<Task>(&self.task_path(&candidate.id)) else {
                continue;
            };
            if fresh.status != TaskStatus::Pending {
                debug!(task = %fresh.id, status = %fresh.status, "Candidate already taken");
                self.tasks.lock().upsert(fresh);
                continue;
            }
            self.mark_claimed(&mut fresh, claimant)?;
            return Ok(Some(fresh));
        }
        Ok(None)
    }

    fn mark_claimed(&self, task: &mut Task, claimant: &str) -> Result<(), NestError> {
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(claimant.to_string());
        self.write_task(task)?;
        debug!(task = %task.id, claimant, "Task claimed");
        Ok(())
    }

    // --- Pheromones ----------------------------------------------------

    /// Append one pheromone to the trail. No lock is taken.
    pub fn drop_pheromone(&self, pheromone: &Pheromone) -> Result<(), NestError> {
        self.trail.append(pheromone)
    }

    /// Live pheromones with decayed strengths.
    pub fn read_all_pheromones(&self) -> Vec<Pheromone> {
        self.trail.read_all(Utc::now())
    }

    /// Refresh the trail and return its file index.
    pub fn pheromone_index(&self) -> PheromoneIndex {
        self.trail.read_all(Utc::now());
        self.trail.index()
    }

    /// The strongest `limit` pheromones touching `files` (all pheromones when
    /// `files` is empty) as a text digest.
    pub fn pheromone_context(&self, files: &[String], limit: usize) -> String {
        digest(&self.pheromone_index(), files, limit)
    }

    // --- Lifecycle -----------------------------------------------------

    /// Id of the newest colony under `working_dir` that is neither terminal
    /// nor finished.
    pub fn find_resumable(working_dir: &Path) -> Option<String> {
        let entries = fs::read_dir(working_dir.join(NEST_ROOT)).ok()?;
        entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| read_json::<Colony>(&entry.path().join(COLONY_FILE)))
            .filter(Colony::is_resumable)
            .max_by_key(|colony| colony.created_at)
            .map(|colony| colony.id)
    }

    /// Reload after a crash. Tasks left claimed or active go back to
    /// pending and ants still marked working are failed. Temp files older
    /// than the lock staleness window are removed.
    pub async fn resume(&self) -> Result<Colony, NestError> {
        self.trail.reset();
        if !self.colony_path().exists() {
            return Err(NestError::ColonyNotFound(self.colony_id.clone()));
        }

        let _guard = self.lock.acquire().await?;
        remove_interrupted_writes(&self.dir, LOCK_STALE_AFTER);
        remove_interrupted_writes(&self.tasks_dir(), LOCK_STALE_AFTER);
        let mut colony: Colony = read_json(&self.colony_path())
            .ok_or_else(|| NestError::ColonyNotFound(self.colony_id.clone()))?;

        let mut requeued = 0;
        for mut task in self.refresh_tasks() {
            if matches!(task.status, TaskStatus::Claimed | TaskStatus::Active) {
                task.requeue();
                self.write_task(&task)?;
                requeued += 1;
            }
        }
        for ant in colony.ants.iter_mut().filter(|a| a.status == AntStatus::Working) {
            ant.finish(AntStatus::Failed);
        }
        self.store_colony(&colony)?;

        if requeued > 0 {
            warn!(colony = %self.colony_id, requeued, "Requeued tasks orphaned by a previous run");
        }
        colony.tasks = self.read_all_tasks();
        colony.pheromones = self.trail.read_all(Utc::now());
        info!(colony = %self.colony_id, status = %colony.status, "Colony resumed");
        Ok(colony)
    }

    /// Remove every persisted file of this colony.
    pub fn destroy(&self) -> Result<(), NestError> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.tasks.lock().invalidate();
        *self.colony.lock() = None;
        self.trail.reset();
        debug!(dir = %self.dir.display(), "Nest destroyed");
        Ok(())
    }
}
