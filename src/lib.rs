// ABOUTME: Root module for colony - disk-coordinated worker colonies for codebase goals.
// ABOUTME: Re-exports the queen entry points and the types invokers handle.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod model;
pub mod nest;
pub mod parser;
pub mod pheromone;
pub mod prelude;
pub mod queen;
pub mod spawner;
pub mod telemetry;

pub use config::{ColonyRequest, QueenConfig, SpawnerConfig};
pub use error::ColonyError;
pub use queen::{ColonyObserver, Queen};
