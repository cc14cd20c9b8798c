// ABOUTME: Builds caste-specific prompts and the private prompt file handed to a worker.
// ABOUTME: The file is created owner-only and removed when the handle drops.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::SpawnError;
use crate::model::{Caste, Task};

const REPORT_FORMAT: &str = "\
End your reply with a report using these markdown sections when they apply:
## Discoveries      facts about the code others should know
## Pheromones       progress notes for other ants
## Files Changed    one bullet per file you modified
## Warnings         risks, traps, or things that broke

To declare follow-up work, add one block per task:
TASK: <short title>
- description: <what to do>
- files: <comma separated paths>
- caste: worker | scout | soldier
- priority: <1 (urgent) to 5>
- context: <anything the next ant needs>";

fn caste_instructions(caste: Caste) -> &'static str {
    match caste {
        Caste::Scout => {
            "You are a scout ant. Explore the repository and break the goal into \
             independent tasks with disjoint file scopes. Do not modify any file. \
             Every task you declare must list the files it will touch."
        }
        Caste::Worker => {
            "You are a worker ant. Complete exactly the task below, touching only the \
             files in its scope unless unavoidable. Keep changes minimal and leave the \
             code building."
        }
        Caste::Soldier => {
            "You are a soldier ant. Review the changes made to the files below. Do not \
             modify any file. Report problems under a `## Review` section and declare \
             a worker task for each fix that is needed."
        }
    }
}

/// The system prompt for one ant working `task` toward `goal`.
pub fn system_prompt(task: &Task, goal: &str, pheromones: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(caste_instructions(task.caste));
    prompt.push_str("\n\nColony goal: ");
    prompt.push_str(goal);
    prompt.push('\n');

    if !pheromones.trim().is_empty() {
        prompt.push_str("\nPheromone trail left by other ants (strongest first):\n");
        prompt.push_str(pheromones);
    }

    prompt.push_str("\nYour task: ");
    prompt.push_str(&task.title);
    prompt.push('\n');
    if !task.description.is_empty() {
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.files.is_empty() {
        prompt.push_str("Files in scope: ");
        prompt.push_str(&task.files.join(", "));
        prompt.push('\n');
    }
    if let Some(context) = &task.context {
        prompt.push_str("Context: ");
        prompt.push_str(context);
        prompt.push('\n');
    }

    prompt.push('\n');
    prompt.push_str(REPORT_FORMAT);
    prompt
}

/// The instruction passed as the worker's only input.
pub fn instruction(task: &Task) -> String {
    if task.description.is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, task.description)
    }
}

/// A prompt written to a private temporary file for the life of one run.
pub struct PromptFile {
    file: NamedTempFile,
}

impl PromptFile {
    pub fn write(contents: &str) -> Result<Self, SpawnError> {
        let mut file = tempfile::Builder::new()
            .prefix("colony-prompt-")
            .suffix(".md")
            .tempfile()
            .map_err(SpawnError::Prompt)?;
        file.write_all(contents.as_bytes()).map_err(SpawnError::Prompt)?;
        file.flush().map_err(SpawnError::Prompt)?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
