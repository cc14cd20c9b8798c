// ABOUTME: Nest module - crash-tolerant on-disk coordination for a colony.
// ABOUTME: Advisory lock, atomic files, task cache and the pheromone trail.

mod cache;
mod files;
mod lock;
mod store;
mod trail;

pub use cache::TaskCache;
pub use lock::{
    LOCK_SPIN_MAX, LOCK_SPIN_MIN, LOCK_STALE_AFTER, LOCK_WAIT_CEILING, LockGuard, LockHolder,
    LockSettings, NestLock, process_alive,
};
pub use store::{NEST_ROOT, Nest, nest_dir};
pub use trail::{COMPACT_EVERY_READS, PheromoneTrail, digest};

#[cfg(test)]
mod nest_test;
