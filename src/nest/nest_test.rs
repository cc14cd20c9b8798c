// ABOUTME: Tests for the nest store.
// ABOUTME: Round trips, claims across instances, resume, discovery and cleanup.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use super::store::{Nest, nest_dir};
use crate::error::NestError;
use crate::model::{
    Ant, AntStatus, Caste, Colony, ColonyPatch, ColonyStatus, ConcurrencyConfig, LoadSample,
    Pheromone, PheromoneType, SAMPLE_WINDOW, Task, TaskStatus,
};

fn colony_with(id: &str, tasks: Vec<Task>) -> Colony {
    let mut colony = Colony::new(id, "make the tests pass", ConcurrencyConfig::new(1, 4));
    colony.tasks = tasks;
    colony
}

fn worker_task(id: &str, priority: u8, files: &[&str]) -> Task {
    Task::new(id, Caste::Worker, format!("task {}", id))
        .priority(priority)
        .files(files.iter().copied())
}

async fn seeded(dir: &TempDir, tasks: Vec<Task>) -> Nest {
    let nest = Nest::open(dir.path(), "colony-1").with_rng_seed(1);
    nest.initialize(&colony_with("colony-1", tasks)).await.unwrap();
    nest
}

#[tokio::test]
async fn test_initialize_round_trip() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![worker_task("t1", 2, &["a.rs"]), worker_task("t2", 3, &[])]).await;

    let light = nest.read_colony_light().unwrap();
    assert_eq!(light.goal, "make the tests pass");
    assert!(light.tasks.is_empty());

    // A fresh instance has an empty cache and must scan the task directory.
    let reopened = Nest::open(dir.path(), "colony-1");
    let full = reopened.read_colony_full().unwrap();
    let ids: Vec<&str> = full.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2"]);
    assert_eq!(full.status, ColonyStatus::Scouting);
}

#[tokio::test]
async fn test_missing_colony_reads_as_none() {
    let dir = TempDir::new().unwrap();
    let nest = Nest::open(dir.path(), "nope");
    assert!(nest.read_colony_light().is_none());
    assert!(nest.read_task("t1").is_none());
    assert!(nest.read_all_tasks().is_empty());
}

#[tokio::test]
async fn test_corrupt_task_file_reads_as_missing() {
    let dir = TempDir::new().unwrap();
    seeded(&dir, vec![worker_task("t1", 3, &[])]).await;
    let tasks_dir = nest_dir(dir.path(), "colony-1").join("tasks");
    std::fs::write(tasks_dir.join("broken.json"), "{ truncated").unwrap();

    let reopened = Nest::open(dir.path(), "colony-1");
    assert_eq!(reopened.read_all_tasks().len(), 1);
    assert!(reopened.read_task("broken").is_none());
}

#[tokio::test]
async fn test_claim_task_only_from_pending() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![worker_task("t1", 3, &[])]).await;

    assert!(nest.claim_task("t1", "ant-1").await.unwrap());
    let task = nest.read_task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.claimed_by.as_deref(), Some("ant-1"));

    assert!(!nest.claim_task("t1", "ant-2").await.unwrap());
    assert_eq!(nest.read_task("t1").unwrap().claimed_by.as_deref(), Some("ant-1"));
    assert!(!nest.claim_task("missing", "ant-2").await.unwrap());
}

#[tokio::test]
async fn test_claim_next_drains_role_queue() {
    let dir = TempDir::new().unwrap();
    let scout = Task::new("s1", Caste::Scout, "explore");
    let nest = seeded(
        &dir,
        vec![worker_task("t1", 1, &["a.rs"]), worker_task("t2", 5, &["b.rs"]), scout],
    )
    .await;

    let mut claimed = Vec::new();
    while let Some(task) = nest.claim_next_task(Caste::Worker, "ant-x").await.unwrap() {
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by.as_deref(), Some("ant-x"));
        claimed.push(task.id);
    }
    claimed.sort();
    assert_eq!(claimed, vec!["t1", "t2"]);

    // Claims are persisted, not just cached.
    let reopened = Nest::open(dir.path(), "colony-1");
    assert_eq!(reopened.read_task("t1").unwrap().status, TaskStatus::Claimed);
    assert_eq!(reopened.read_task("s1").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_claim_next_skips_task_claimed_elsewhere() {
    let dir = TempDir::new().unwrap();
    let ours = seeded(&dir, vec![worker_task("t1", 3, &[])]).await;
    let theirs = Nest::open(dir.path(), "colony-1");

    // Our cache still says pending.
    assert_eq!(ours.read_all_tasks()[0].status, TaskStatus::Pending);
    assert!(theirs.claim_task("t1", "other-process").await.unwrap());

    assert!(ours.claim_next_task(Caste::Worker, "ant-1").await.unwrap().is_none());
    assert_eq!(ours.read_task("t1").unwrap().claimed_by.as_deref(), Some("other-process"));
}

#[tokio::test]
async fn test_update_colony_uses_freshest_disk_copy() {
    let dir = TempDir::new().unwrap();
    let ours = seeded(&dir, vec![]).await;
    let theirs = Nest::open(dir.path(), "colony-1");

    theirs
        .update_colony(ColonyPatch::new().status(ColonyStatus::Working))
        .await
        .unwrap();
    let mut concurrency = ConcurrencyConfig::new(1, 4);
    concurrency.current = 3;
    let updated = ours
        .update_colony(ColonyPatch::new().concurrency(concurrency))
        .await
        .unwrap();

    assert_eq!(updated.status, ColonyStatus::Working);
    assert_eq!(updated.concurrency.current, 3);
    assert_eq!(ours.read_colony_light().unwrap().status, ColonyStatus::Working);
}

#[tokio::test]
async fn test_update_missing_colony_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(nest_dir(dir.path(), "ghost")).unwrap();
    let nest = Nest::open(dir.path(), "ghost");
    let err = nest.update_colony(ColonyPatch::new()).await.unwrap_err();
    assert!(matches!(err, NestError::ColonyNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn test_record_sample_bounds_history() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![]).await;
    for i in 0..(SAMPLE_WINDOW + 3) {
        nest.record_sample(LoadSample {
            timestamp: Utc::now(),
            active: i,
            cpu_load: 0.1,
            mem_free_mb: 4096,
            throughput: 1.0,
        })
        .await
        .unwrap();
    }
    let history = nest.read_colony_light().unwrap().concurrency.history;
    assert_eq!(history.len(), SAMPLE_WINDOW);
    assert_eq!(history[0].active, 3);
}

#[tokio::test]
async fn test_update_ant_inserts_then_replaces() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![]).await;
    let mut ant = Ant::new("ant-1", Caste::Worker, "t1");
    nest.update_ant(&ant).await.unwrap();
    ant.status = AntStatus::Working;
    ant.pid = Some(4242);
    nest.update_ant(&ant).await.unwrap();

    let ants = nest.read_colony_light().unwrap().ants;
    assert_eq!(ants.len(), 1);
    assert_eq!(ants[0].pid, Some(4242));
}

#[tokio::test]
async fn test_resume_requeues_in_flight_work() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(
        &dir,
        vec![worker_task("t1", 3, &[]), worker_task("t2", 3, &[]), worker_task("t3", 3, &[])],
    )
    .await;
    assert!(nest.claim_task("t1", "ant-1").await.unwrap());
    let mut active = nest.read_task("t2").unwrap();
    active.status = TaskStatus::Active;
    active.claimed_by = Some("ant-2".into());
    active.started_at = Some(Utc::now());
    nest.write_task(&active).unwrap();
    let mut ant = Ant::new("ant-2", Caste::Worker, "t2");
    ant.status = AntStatus::Working;
    nest.update_ant(&ant).await.unwrap();
    drop(nest);

    let revived = Nest::open(dir.path(), "colony-1");
    let colony = revived.resume().await.unwrap();

    for task in &colony.tasks {
        assert_eq!(task.status, TaskStatus::Pending, "{}", task.id);
        assert!(task.claimed_by.is_none());
    }
    assert_eq!(colony.ants[0].status, AntStatus::Failed);
    assert!(colony.ants[0].finished_at.is_some());
}

/// Write a temp file whose modification time is `age` in the past.
fn leftover_write(path: &std::path::Path, age: std::time::Duration) {
    std::fs::write(path, "{").unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::now() - age).unwrap();
}

#[tokio::test]
async fn test_resume_removes_stale_interrupted_writes() {
    let dir = TempDir::new().unwrap();
    seeded(&dir, vec![worker_task("t1", 3, &[])]).await;
    let tasks_dir = nest_dir(dir.path(), "colony-1").join("tasks");
    let stale = tasks_dir.join(".abc123.tmp");
    let fresh = tasks_dir.join(".def456.tmp");
    leftover_write(&stale, std::time::Duration::from_secs(120));
    leftover_write(&fresh, std::time::Duration::ZERO);

    let revived = Nest::open(dir.path(), "colony-1");
    assert!(stale.exists());
    assert_eq!(revived.resume().await.unwrap().tasks.len(), 1);
    assert!(!stale.exists());
    assert!(fresh.exists());
}

#[tokio::test]
async fn test_open_leaves_in_flight_writes_alone() {
    let dir = TempDir::new().unwrap();
    seeded(&dir, vec![]).await;
    let tasks_dir = nest_dir(dir.path(), "colony-1").join("tasks");
    let mut in_flight = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(&tasks_dir)
        .unwrap();
    std::io::Write::write_all(&mut in_flight, b"{}").unwrap();

    let _peer = Nest::open(dir.path(), "colony-1");
    assert!(in_flight.persist(tasks_dir.join("late.json")).is_ok());
}

#[tokio::test]
async fn test_task_round_trip_through_fresh_instance() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![]).await;
    let mut task = Task::new("t9", Caste::Soldier, "Review cache")
        .description("Check eviction")
        .priority(2)
        .files(["src/cache.rs", "src/lru.rs"])
        .context("seen in prod")
        .parent("t1");
    task.status = TaskStatus::Failed;
    task.claimed_by = Some("ant-3".into());
    task.result = Some("partial".into());
    task.error = Some("EACCES".into());
    task.spawned_tasks = vec!["t10".into(), "t11".into()];
    task.started_at = Some(Utc::now() - Duration::minutes(2));
    task.finished_at = Some(Utc::now());
    nest.write_task(&task).unwrap();

    let reopened = Nest::open(dir.path(), "colony-1");
    assert_eq!(reopened.read_task("t9").unwrap(), task);
}

#[tokio::test]
async fn test_resume_without_colony_fails() {
    let dir = TempDir::new().unwrap();
    let nest = Nest::open(dir.path(), "missing");
    assert!(matches!(nest.resume().await, Err(NestError::ColonyNotFound(_))));
}

#[tokio::test]
async fn test_find_resumable_prefers_newest_unfinished() {
    let dir = TempDir::new().unwrap();
    assert!(Nest::find_resumable(dir.path()).is_none());

    let finished = Nest::open(dir.path(), "done-colony");
    let mut done = colony_with("done-colony", vec![]);
    done.status = ColonyStatus::Done;
    done.finished_at = Some(Utc::now());
    finished.initialize(&done).await.unwrap();

    let older = Nest::open(dir.path(), "older");
    let mut older_colony = colony_with("older", vec![]);
    older_colony.created_at = Utc::now() - Duration::hours(1);
    older.initialize(&older_colony).await.unwrap();

    let newer = Nest::open(dir.path(), "newer");
    let mut newer_colony = colony_with("newer", vec![]);
    newer_colony.status = ColonyStatus::Working;
    newer.initialize(&newer_colony).await.unwrap();

    assert_eq!(Nest::find_resumable(dir.path()).as_deref(), Some("newer"));
}

#[tokio::test]
async fn test_pheromone_context_is_scoped_to_files() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![]).await;
    for (id, file) in [("p1", "a.rs"), ("p2", "b.rs")] {
        let p = Pheromone::new(id, PheromoneType::Discovery, "ant-1", Caste::Scout, "t0", id)
            .files([file]);
        nest.drop_pheromone(&p).unwrap();
    }

    let scoped = nest.pheromone_context(&["b.rs".to_string()], 5);
    assert_eq!(scoped.lines().count(), 1);
    assert!(scoped.contains("p2"));
    assert_eq!(nest.pheromone_context(&[], 5).lines().count(), 2);
    assert_eq!(nest.read_colony_full().unwrap().pheromones.len(), 2);
}

#[tokio::test]
async fn test_destroy_removes_everything() {
    let dir = TempDir::new().unwrap();
    let nest = seeded(&dir, vec![worker_task("t1", 3, &[])]).await;
    nest.destroy().unwrap();

    assert!(!nest.dir().exists());
    assert!(nest.read_colony_light().is_none());
    assert!(nest.read_all_tasks().is_empty());
    nest.destroy().unwrap();
}
