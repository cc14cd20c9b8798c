// ABOUTME: Spawner module - worker process lifecycle for claimed tasks.
// ABOUTME: Prompt building, event stream decoding, process launching and settling.

mod events;
mod process;
mod prompt;
mod spawner;

pub use events::{EventDecoder, RunTally, WorkerEvent};
pub use process::{LaunchEvent, LaunchSpec, Launcher, ProcessLauncher, TERMINATE_GRACE, WorkerRun};
pub use prompt::{PromptFile, instruction, system_prompt};
pub use spawner::{
    ProgressCallback, RATE_LIMIT_MARKERS, SpawnOutcome, Spawner, is_rate_limited,
};

#[cfg(test)]
mod process_test;
#[cfg(test)]
mod spawner_test;
