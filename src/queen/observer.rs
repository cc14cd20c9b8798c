// ABOUTME: Observer callbacks the queen invokes as a colony progresses.
// ABOUTME: Every method has a no-op default; invokers override what they render.

use std::time::Duration;

use crate::model::{Ant, Colony, ColonyMetrics, ColonyStatus, ConcurrencyConfig, Task};
use crate::spawner::{SpawnOutcome, WorkerEvent};

/// Receives colony progress. The queen never writes to a terminal itself.
pub trait ColonyObserver: Send + Sync {
    fn on_phase(&self, _colony_id: &str, _status: ColonyStatus) {}

    /// A task was claimed and is about to get an ant.
    fn on_ant_spawned(&self, _task: &Task) {}

    fn on_ant_finished(&self, _outcome: &SpawnOutcome) {}

    /// One streamed event from a running ant.
    fn on_progress(&self, _ant: &Ant, _event: &WorkerEvent) {}

    fn on_metrics(&self, _metrics: &ColonyMetrics) {}

    /// A batch hit a rate limit; the queen throttled to `concurrency` and
    /// will wait `backoff` before the next batch.
    fn on_rate_limited(&self, _concurrency: &ConcurrencyConfig, _backoff: Duration) {}

    fn on_complete(&self, _colony: &Colony) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ColonyObserver for NoopObserver {}
