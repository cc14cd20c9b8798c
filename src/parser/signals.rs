// ABOUTME: Extracts pheromone deposits from the named sections of a report.
// ABOUTME: Failed tasks also yield a repellent over the task's files.

use super::tasks::task_marker;
use crate::model::{Ant, MAX_PHEROMONE_CONTENT, Pheromone, PheromoneType, Task, truncate_chars};

/// A pheromone parsed from output, before it is given an id and origin.
#[derive(Debug, Clone, PartialEq)]
pub struct PheromoneDraft {
    pub kind: PheromoneType,
    pub content: String,
    pub files: Vec<String>,
}

impl PheromoneDraft {
    pub fn into_pheromone(self, id: impl Into<String>, ant: &Ant) -> Pheromone {
        Pheromone::new(id, self.kind, &ant.id, ant.caste, &ant.task_id, &self.content)
            .files(self.files)
    }
}

/// Map a section name to the pheromone type it deposits.
fn section_kind(name: &str) -> Option<PheromoneType> {
    let name = name.trim().trim_end_matches(':').trim().to_ascii_lowercase();
    let kind = if name.starts_with("discover") {
        PheromoneType::Discovery
    } else if name.starts_with("pheromone") || name.starts_with("signal") || name == "notes" {
        PheromoneType::Progress
    } else if ["files changed", "changed files", "files modified", "modified files"]
        .iter()
        .any(|s| name.starts_with(s))
    {
        PheromoneType::Completion
    } else if name.starts_with("warning") || name.starts_with("review") {
        PheromoneType::Warning
    } else {
        return None;
    };
    Some(kind)
}

enum Line<'a> {
    /// A heading naming a recognized section.
    Section(PheromoneType),
    /// A markdown heading naming anything else.
    OtherHeading,
    Body(&'a str),
}

fn classify(raw: &str) -> Line<'_> {
    let line = raw.trim();
    // Task declarations are never part of a pheromone section.
    if task_marker(line).is_some() {
        return Line::OtherHeading;
    }
    if let Some(rest) = line.strip_prefix('#') {
        return match section_kind(rest.trim_start_matches('#')) {
            Some(kind) => Line::Section(kind),
            None => Line::OtherHeading,
        };
    }
    // `Discoveries:` or `**Discoveries:**` on a line of its own.
    let unbolded = line.trim_matches('*').trim();
    if unbolded.ends_with(':') {
        if let Some(kind) = section_kind(unbolded) {
            return Line::Section(kind);
        }
    }
    Line::Body(line)
}

/// Extract pheromones from `text` produced while working on `task`.
///
/// Each recognized section yields one pheromone whose content is the
/// section body, capped at the pheromone content limit. Files-changed
/// bullets name the files of the completion pheromone; every other type is
/// scoped to the task's files. When `success` is false a repellent is
/// added.
pub fn extract_pheromones(text: &str, task: &Task, success: bool) -> Vec<PheromoneDraft> {
    let mut out = Vec::new();
    let mut current: Option<(PheromoneType, Vec<&str>)> = None;

    for raw in text.lines() {
        match classify(raw) {
            Line::Section(kind) => {
                out.extend(current.take().and_then(|(k, body)| draft(k, &body, task)));
                current = Some((kind, Vec::new()));
            }
            Line::OtherHeading => {
                out.extend(current.take().and_then(|(k, body)| draft(k, &body, task)));
            }
            Line::Body(line) => {
                if let Some((_, body)) = current.as_mut() {
                    if !line.is_empty() {
                        body.push(line);
                    }
                }
            }
        }
    }
    out.extend(current.and_then(|(k, body)| draft(k, &body, task)));

    if !success {
        let reason = text.trim();
        let content = if reason.is_empty() {
            format!("Failed: {}", task.title)
        } else {
            format!("Failed: {}\n{}", task.title, reason)
        };
        out.push(PheromoneDraft {
            kind: PheromoneType::Repellent,
            content: truncate_chars(&content, MAX_PHEROMONE_CONTENT),
            files: task.files.clone(),
        });
    }
    out
}

fn draft(kind: PheromoneType, body: &[&str], task: &Task) -> Option<PheromoneDraft> {
    if body.is_empty() {
        return None;
    }
    let files = if kind == PheromoneType::Completion {
        let listed: Vec<String> = body.iter().filter_map(|line| bullet_path(line)).collect();
        if listed.is_empty() { task.files.clone() } else { listed }
    } else {
        task.files.clone()
    };
    Some(PheromoneDraft {
        kind,
        content: truncate_chars(&body.join("\n"), MAX_PHEROMONE_CONTENT),
        files,
    })
}

/// The path at the start of a bullet such as ``- `src/a.rs`: added x``.
fn bullet_path(line: &str) -> Option<String> {
    let item = line.trim_start_matches(['-', '*', '+']).trim();
    let token = item.split_whitespace().next()?;
    let path = token.trim_matches(['`', ',', ':', ';', '"', '\'']);
    if path.is_empty() || path.eq_ignore_ascii_case("none") {
        return None;
    }
    Some(path.to_string())
}
