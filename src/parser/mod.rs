// ABOUTME: Output parser - structured declarations from an ant's final report.
// ABOUTME: Two independent passes: sub-tasks and pheromone sections.

mod signals;
mod tasks;

pub use signals::{PheromoneDraft, extract_pheromones};
pub use tasks::{TaskDeclaration, extract_tasks};

use crate::model::Task;

/// Everything extracted from one report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub tasks: Vec<TaskDeclaration>,
    pub pheromones: Vec<PheromoneDraft>,
}

/// Run both extraction passes over the final text of `task`.
pub fn parse_output(text: &str, task: &Task, success: bool) -> ParsedOutput {
    ParsedOutput {
        tasks: extract_tasks(text),
        pheromones: extract_pheromones(text, task, success),
    }
}
