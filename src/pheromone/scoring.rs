// ABOUTME: Priority + pheromone scoring and epsilon-greedy task selection.
// ABOUTME: Used by the nest while holding the lock in claim_next_task.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::model::{Pheromone, PheromoneType, Task};

/// Pheromones at or below this strength do not influence scoring.
pub const RELEVANCE_FLOOR: f64 = 0.1;

/// Probability of ignoring scores and picking a random candidate.
pub const EXPLORATION_RATE: f64 = 0.1;

/// Live pheromones indexed by the files they touch.
#[derive(Debug, Clone, Default)]
pub struct PheromoneIndex {
    pheromones: Vec<Pheromone>,
    by_file: HashMap<String, Vec<usize>>,
}

impl PheromoneIndex {
    /// Build an index over already-decayed pheromones.
    pub fn build(pheromones: Vec<Pheromone>) -> Self {
        let mut by_file: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, p) in pheromones.iter().enumerate() {
            for file in &p.files {
                by_file.entry(file.clone()).or_default().push(idx);
            }
        }
        Self { pheromones, by_file }
    }

    pub fn pheromones(&self) -> &[Pheromone] {
        &self.pheromones
    }

    pub fn len(&self) -> usize {
        self.pheromones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pheromones.is_empty()
    }

    /// Pheromones touching `file`.
    pub fn touching<'a>(&'a self, file: &str) -> impl Iterator<Item = &'a Pheromone> + 'a {
        self.by_file
            .get(file)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.pheromones[idx])
    }

    /// Distinct pheromones touching any of `files`, in index order.
    pub fn relevant_to(&self, files: &[String]) -> Vec<&Pheromone> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for file in files {
            for p in self.touching(file) {
                if seen.insert(p.id.as_str()) {
                    out.push(p);
                }
            }
        }
        out
    }
}

fn contribution(p: &Pheromone) -> f64 {
    match p.kind {
        PheromoneType::Discovery | PheromoneType::Completion => p.strength,
        PheromoneType::Warning => -p.strength,
        PheromoneType::Repellent => -3.0 * p.strength,
        PheromoneType::Progress | PheromoneType::Dependency => 0.0,
    }
}

/// `(6 - priority)` plus the contribution of every relevant pheromone touching
/// the task's files, each counted once.
pub fn score(task: &Task, index: &PheromoneIndex) -> f64 {
    let base = 6.0 - f64::from(task.priority);
    index
        .relevant_to(&task.files)
        .into_iter()
        .filter(|p| p.strength > RELEVANCE_FLOOR)
        .map(contribution)
        .fold(base, |acc, c| acc + c)
}

/// Order candidates for claiming: best score first, ties in input order.
///
/// With probability [`EXPLORATION_RATE`], and only when there is more than
/// one candidate, a uniformly random candidate is moved to the front instead.
pub fn rank<R: Rng>(candidates: Vec<Task>, index: &PheromoneIndex, rng: &mut R) -> Vec<Task> {
    if candidates.len() > 1 && rng.random::<f64>() < EXPLORATION_RATE {
        let mut candidates = candidates;
        let pick = rng.random_range(0..candidates.len());
        let chosen = candidates.remove(pick);
        candidates.insert(0, chosen);
        return candidates;
    }

    let mut scored: Vec<(f64, Task)> = candidates
        .into_iter()
        .map(|t| (score(&t, index), t))
        .collect();
    // sort_by is stable, so equal scores keep arrival order.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, t)| t).collect()
}
