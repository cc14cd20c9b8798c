// ABOUTME: Concurrency module - adaptive parallelism and host load probing.
// ABOUTME: The controller is pure; probes supply the samples it learns from.

mod controller;
mod probe;

pub use controller::{
    CPU_HYSTERESIS, CPU_OVERLOAD, CPU_RECOVERY, EXPLORATION_SAMPLES, MEM_FLOOR_MB,
    RATE_LIMIT_COOLDOWN_SECS, adapt,
};
pub use probe::{FixedLoadProbe, LoadProbe, SystemLoad, SystemLoadProbe};
