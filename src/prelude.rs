// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use colony::prelude::*;` to get started quickly.

pub use crate::concurrency::{FixedLoadProbe, LoadProbe, SystemLoad, SystemLoadProbe};
pub use crate::config::{ColonyRequest, QueenConfig, SpawnerConfig};
pub use crate::error::{ColonyError, NestError, SpawnError};
pub use crate::model::{
    Ant, AntStatus, AntUsage, Caste, Colony, ColonyMetrics, ColonyStatus, ConcurrencyConfig,
    Pheromone, PheromoneType, Task, TaskStatus,
};
pub use crate::nest::{LockSettings, Nest};
pub use crate::queen::{ColonyObserver, ErrorClass, NoopObserver, Queen};
pub use crate::spawner::{
    LaunchEvent, LaunchSpec, Launcher, ProcessLauncher, SpawnOutcome, WorkerEvent, WorkerRun,
};
