// ABOUTME: Tests for the ant lifecycle against a scripted launcher.
// ABOUTME: Success, failure, rate limiting, cancellation and launch errors.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::WorkerEvent;
use super::process::{LaunchEvent, LaunchSpec, Launcher, WorkerRun};
use super::spawner::{Spawner, is_rate_limited};
use crate::config::SpawnerConfig;
use crate::error::SpawnError;
use crate::model::{
    Ant, AntStatus, Caste, Colony, ConcurrencyConfig, IdGenerator, PheromoneType, Task, TaskStatus,
};
use crate::nest::Nest;

enum Script {
    Run {
        events: Vec<WorkerEvent>,
        exit_code: i32,
        stderr: &'static str,
    },
    Hang,
    Unlaunchable,
}

struct ScriptedLauncher {
    script: Script,
    launched: Mutex<Vec<LaunchSpec>>,
}

impl ScriptedLauncher {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            launched: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<LaunchEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkerRun, SpawnError> {
        self.launched.lock().push(spec.clone());
        match &self.script {
            Script::Unlaunchable => Err(SpawnError::Launch {
                program: spec.program.clone(),
                message: "No such file or directory".into(),
            }),
            Script::Hang => {
                let _ = events.send(LaunchEvent::Started { pid: 4242 });
                cancel.cancelled().await;
                Ok(WorkerRun {
                    exit_code: None,
                    stderr: String::new(),
                    cancelled: true,
                })
            }
            Script::Run {
                events: script,
                exit_code,
                stderr,
            } => {
                let _ = events.send(LaunchEvent::Started { pid: 4242 });
                for event in script {
                    let _ = events.send(LaunchEvent::Event(event.clone()));
                }
                Ok(WorkerRun {
                    exit_code: Some(*exit_code),
                    stderr: stderr.to_string(),
                    cancelled: false,
                })
            }
        }
    }
}

fn assistant(text: &str) -> WorkerEvent {
    WorkerEvent::Assistant {
        text: text.into(),
        input_tokens: 100,
        output_tokens: 20,
        cost: 0.1,
    }
}

fn result(text: &str) -> WorkerEvent {
    WorkerEvent::Result {
        text: text.into(),
        total_cost: Some(0.4),
        turns: Some(2),
        is_error: false,
    }
}

struct Fixture {
    _dir: TempDir,
    nest: Arc<Nest>,
    task: Task,
}

async fn fixture(caste: Caste) -> Fixture {
    let dir = TempDir::new().unwrap();
    let nest = Arc::new(Nest::open(dir.path(), "colony-1"));
    let mut colony = Colony::new("colony-1", "harden the parser", ConcurrencyConfig::new(1, 4));
    colony.model_overrides.insert(Caste::Soldier, "opus".into());
    colony.tasks = vec![Task::new("task-1", caste, "Fix parser").files(["src/parser.rs"])];
    nest.initialize(&colony).await.unwrap();
    assert!(nest.claim_task("task-1", "ant-1").await.unwrap());
    let task = nest.read_task("task-1").unwrap();
    Fixture {
        _dir: dir,
        nest,
        task,
    }
}

fn spawner(fx: &Fixture, launcher: Arc<ScriptedLauncher>) -> Spawner {
    Spawner::new(
        fx.nest.clone(),
        launcher,
        Arc::new(IdGenerator::new()),
        SpawnerConfig::default().program("fake-worker"),
        fx.nest.dir(),
    )
}

const REPORT: &str = "Done.

## Discoveries
- the tokenizer allocates per char

TASK: Pool tokenizer buffers
- files: src/tokenizer.rs
- priority: 2
";

#[tokio::test]
async fn test_success_records_result_children_and_pheromones() {
    let fx = fixture(Caste::Worker).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![assistant("working"), result(REPORT)],
        exit_code: 0,
        stderr: "",
    });
    let outcome = spawner(&fx, launcher).spawn(fx.task.clone(), CancellationToken::new()).await;

    assert!(outcome.success);
    assert_eq!(outcome.ant.id, "ant-1");
    assert_eq!(outcome.task.status, TaskStatus::Done);
    assert_eq!(outcome.new_tasks.len(), 1);
    assert_eq!(outcome.task.spawned_tasks, vec![outcome.new_tasks[0].id.clone()]);

    let stored = fx.nest.read_task("task-1").unwrap();
    assert_eq!(stored.status, TaskStatus::Done);
    assert_eq!(stored.result.as_deref(), Some(REPORT));
    assert!(stored.finished_at.is_some());

    let child = fx.nest.read_task(&outcome.new_tasks[0].id).unwrap();
    assert_eq!(child.status, TaskStatus::Pending);
    assert_eq!(child.parent_id.as_deref(), Some("task-1"));
    assert_eq!(child.files, vec!["src/tokenizer.rs"]);

    let pheromones = fx.nest.read_all_pheromones();
    assert_eq!(pheromones.len(), 1);
    assert_eq!(pheromones[0].kind, PheromoneType::Discovery);
    assert_eq!(pheromones[0].ant_id, "ant-1");

    let ants = fx.nest.read_colony_light().unwrap().ants;
    assert_eq!(ants.len(), 1);
    assert_eq!(ants[0].status, AntStatus::Done);
    assert_eq!(ants[0].pid, Some(4242));
    assert_eq!(ants[0].usage.cost, 0.4);
    assert_eq!(ants[0].usage.input_tokens, 100);
    assert_eq!(ants[0].usage.turns, 2);
}

#[tokio::test]
async fn test_nonzero_exit_fails_task_with_repellent() {
    let fx = fixture(Caste::Worker).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![],
        exit_code: 2,
        stderr: "error: cannot find module `parser`",
    });
    let outcome = spawner(&fx, launcher).spawn(fx.task.clone(), CancellationToken::new()).await;

    assert!(!outcome.success);
    assert!(!outcome.rate_limited);
    let stored = fx.nest.read_task("task-1").unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().contains("cannot find module"));

    let pheromones = fx.nest.read_all_pheromones();
    assert_eq!(pheromones.len(), 1);
    assert_eq!(pheromones[0].kind, PheromoneType::Repellent);
    assert_eq!(pheromones[0].files, vec!["src/parser.rs"]);
    assert_eq!(outcome.ant.status, AntStatus::Failed);
}

#[tokio::test]
async fn test_rate_limit_requeues_task() {
    let fx = fixture(Caste::Worker).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![],
        exit_code: 1,
        stderr: "API Error: 429 Too Many Requests",
    });
    let outcome = spawner(&fx, launcher).spawn(fx.task.clone(), CancellationToken::new()).await;

    assert!(outcome.rate_limited);
    assert!(!outcome.success);
    let stored = fx.nest.read_task("task-1").unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert!(stored.claimed_by.is_none());
    assert_eq!(outcome.ant.status, AntStatus::Failed);
    assert!(fx.nest.read_all_pheromones().is_empty());
}

#[tokio::test]
async fn test_cancellation_requeues_task() {
    let fx = fixture(Caste::Worker).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = spawner(&fx, ScriptedLauncher::new(Script::Hang))
        .spawn(fx.task.clone(), cancel)
        .await;

    assert!(outcome.cancelled);
    assert_eq!(fx.nest.read_task("task-1").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_launch_error_becomes_failed_outcome() {
    let fx = fixture(Caste::Worker).await;
    let outcome = spawner(&fx, ScriptedLauncher::new(Script::Unlaunchable))
        .spawn(fx.task.clone(), CancellationToken::new())
        .await;

    assert!(!outcome.success);
    assert!(outcome.output.contains("Failed to launch 'fake-worker'"));
    assert_eq!(fx.nest.read_task("task-1").unwrap().status, TaskStatus::Failed);
    let ants = fx.nest.read_colony_light().unwrap().ants;
    assert_eq!(ants[0].status, AntStatus::Failed);
}

#[tokio::test]
async fn test_launch_spec_uses_caste_model_and_tools() {
    let fx = fixture(Caste::Soldier).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![result("## Review\n- looks fine")],
        exit_code: 0,
        stderr: "",
    });
    spawner(&fx, launcher.clone())
        .spawn(fx.task.clone(), CancellationToken::new())
        .await;

    let specs = launcher.launched.lock();
    let args = &specs[0].args;
    assert_eq!(specs[0].program, "fake-worker");
    let model_at = args.iter().position(|a| a == "--model").unwrap();
    assert_eq!(args[model_at + 1], "opus");
    let tools_at = args.iter().position(|a| a == "--allowedTools").unwrap();
    assert!(!args[tools_at + 1].contains("Edit"));
    let prompt_at = args.iter().position(|a| a == "--append-system-prompt-file").unwrap();
    assert!(!Path::new(&args[prompt_at + 1]).exists());
    assert_eq!(args[args.len() - 2], "--");
    assert_eq!(args[args.len() - 1], "Fix parser");
}

#[tokio::test]
async fn test_progress_callback_sees_every_event() {
    let fx = fixture(Caste::Worker).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![assistant("a"), assistant("b"), result("ok")],
        exit_code: 0,
        stderr: "",
    });
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let spawner = spawner(&fx, launcher).on_event(Arc::new(move |ant: &Ant, _event: &WorkerEvent| {
        assert_eq!(ant.id, "ant-1");
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    spawner.spawn(fx.task.clone(), CancellationToken::new()).await;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_successful_report_mentioning_429_stays_done() {
    let fx = fixture(Caste::Worker).await;
    let launcher = ScriptedLauncher::new(Script::Run {
        events: vec![result("Mapped HTTP 429 responses to a retry.")],
        exit_code: 0,
        stderr: "",
    });
    let outcome = spawner(&fx, launcher).spawn(fx.task.clone(), CancellationToken::new()).await;

    assert!(outcome.success);
    assert!(!outcome.rate_limited);
    assert_eq!(fx.nest.read_task("task-1").unwrap().status, TaskStatus::Done);
}

#[test]
fn test_rate_limit_markers() {
    assert!(is_rate_limited("HTTP 429"));
    assert!(is_rate_limited("Rate limit reached for requests"));
    assert!(is_rate_limited("rate_limit_error"));
    assert!(!is_rate_limited("syntax error near line 12"));
}
