// ABOUTME: Data model module - tasks, ants, pheromones and the colony record.
// ABOUTME: Pure serde types with no I/O; the nest is their only persister.

mod ant;
mod colony;
mod ids;
mod pheromone;
mod task;

pub use ant::{Ant, AntStatus, AntUsage};
pub use colony::{
    Colony, ColonyMetrics, ColonyPatch, ColonyStatus, ConcurrencyConfig, LoadSample,
    SAMPLE_WINDOW,
};
pub use ids::IdGenerator;
pub use pheromone::{MAX_PHEROMONE_CONTENT, Pheromone, PheromoneType, truncate_chars};
pub use task::{Caste, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN, Task, TaskStatus};
