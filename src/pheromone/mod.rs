// ABOUTME: Prioritization engine - pheromone decay, file index, and scoring.
// ABOUTME: Pure functions shared by the nest and the spawner's prompt digest.

mod decay;
mod scoring;

pub use decay::{EVAPORATION_FLOOR, HALF_LIFE, decayed_strength, is_evaporated};
pub use scoring::{EXPLORATION_RATE, PheromoneIndex, RELEVANCE_FLOOR, rank, score};
