// ABOUTME: Extracts sub-task declarations from an ant's free-text report.
// ABOUTME: Markdown TASK: blocks first, a fenced JSON list as the alternative.

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::model::{Caste, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN, Task};

/// A task declared by an ant, before it is given an id.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDeclaration {
    pub title: String,
    pub description: String,
    pub files: Vec<String>,
    pub caste: Caste,
    pub priority: u8,
    pub context: Option<String>,
}

impl TaskDeclaration {
    fn titled(title: &str) -> Self {
        Self {
            title: title.trim().to_string(),
            description: String::new(),
            files: Vec::new(),
            caste: Caste::Worker,
            priority: PRIORITY_DEFAULT,
            context: None,
        }
    }

    /// Turn the declaration into a pending task owned by `parent_id`.
    pub fn into_task(self, id: impl Into<String>, parent_id: &str) -> Task {
        let mut task = Task::new(id, self.caste, self.title)
            .description(self.description)
            .priority(self.priority)
            .files(self.files)
            .parent(parent_id);
        task.context = self.context;
        task
    }
}

/// Extract every task declared in `text`.
///
/// The markdown form is a line `TASK: <title>` (optionally a heading or in
/// bold) followed by `- field: value` lines. Recognized fields are
/// `description`, `files` (comma separated), `caste` or `role`, `priority`
/// and `context`. When no markdown block is present, a single fenced
/// ```` ```json ```` block holding a list (or `{"tasks": [...]}`) is read
/// instead. Missing fields take defaults; nothing here is fatal.
pub fn extract_tasks(text: &str) -> Vec<TaskDeclaration> {
    let declared = extract_markdown(text);
    if !declared.is_empty() {
        return declared;
    }
    extract_json(text).unwrap_or_default()
}

fn extract_markdown(text: &str) -> Vec<TaskDeclaration> {
    let mut out = Vec::new();
    let mut current: Option<TaskDeclaration> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(title) = task_marker(line) {
            out.extend(current.take().filter(|d| !d.title.is_empty()));
            current = Some(TaskDeclaration::titled(title));
            continue;
        }
        // Any other heading closes the block.
        if line.starts_with('#') {
            out.extend(current.take().filter(|d| !d.title.is_empty()));
            continue;
        }
        let Some(decl) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = field(line) else {
            continue;
        };
        match key.as_str() {
            "description" => decl.description = value.to_string(),
            "files" | "file" => decl.files = split_files(value),
            "caste" | "role" => decl.caste = Caste::parse_lenient(value),
            "priority" => decl.priority = parse_priority(value),
            "context" => decl.context = Some(value.to_string()).filter(|c| !c.is_empty()),
            _ => {}
        }
    }
    out.extend(current.filter(|d| !d.title.is_empty()));
    out
}

/// The title after a `TASK:` marker, ignoring heading hashes and bold.
pub(super) fn task_marker(line: &str) -> Option<&str> {
    let stripped = line
        .trim_start_matches('#')
        .trim()
        .trim_start_matches("**")
        .trim_start();
    let head = stripped.get(..5)?;
    if !head.eq_ignore_ascii_case("task:") {
        return None;
    }
    Some(
        stripped[5..]
            .trim()
            .trim_start_matches("**")
            .trim_end_matches("**")
            .trim(),
    )
}

/// Split `- key: value` into a lowercase key and trimmed value.
fn field(line: &str) -> Option<(String, &str)> {
    let body = line
        .trim_start_matches(['-', '*', '+'])
        .trim_start();
    let (key, value) = body.split_once(':')?;
    let key = key.trim().trim_matches('*').trim().to_ascii_lowercase();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value.trim()))
}

fn split_files(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|f| f.trim().trim_matches('`').trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_priority(value: &str) -> u8 {
    let digits: String = value
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits
        .parse::<u32>()
        .map(|p| p.clamp(u32::from(PRIORITY_MIN), u32::from(PRIORITY_MAX)) as u8)
        .unwrap_or(PRIORITY_DEFAULT)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileList {
    Many(Vec<String>),
    Joined(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Priority {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawDeclaration {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    files: Option<FileList>,
    #[serde(default, alias = "role")]
    caste: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBlock {
    List(Vec<serde_json::Value>),
    Wrapped { tasks: Vec<serde_json::Value> },
}

fn extract_json(text: &str) -> Option<Vec<TaskDeclaration>> {
    let fence = Regex::new(r"(?s)```json\s*(.*?)```").ok()?;
    let body = fence.captures(text)?.get(1)?.as_str();

    let items = match serde_json::from_str::<RawBlock>(body.trim()) {
        Ok(RawBlock::List(items)) | Ok(RawBlock::Wrapped { tasks: items }) => items,
        Err(e) => {
            debug!(error = %e, "Fenced task block is not a task list");
            return None;
        }
    };

    // Entries without a title are skipped, not fatal.
    let declared = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawDeclaration>(item).ok())
        .filter(|raw| !raw.title.trim().is_empty())
        .map(|raw| {
            let mut decl = TaskDeclaration::titled(&raw.title);
            decl.description = raw.description.unwrap_or_default();
            decl.files = match raw.files {
                Some(FileList::Many(files)) => files
                    .iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
                Some(FileList::Joined(joined)) => split_files(&joined),
                None => Vec::new(),
            };
            decl.caste = raw
                .caste
                .as_deref()
                .map(Caste::parse_lenient)
                .unwrap_or(Caste::Worker);
            decl.priority = match raw.priority {
                Some(Priority::Number(n)) => {
                    n.clamp(i64::from(PRIORITY_MIN), i64::from(PRIORITY_MAX)) as u8
                }
                Some(Priority::Text(s)) => parse_priority(&s),
                None => PRIORITY_DEFAULT,
            };
            decl.context = raw.context.filter(|c| !c.trim().is_empty());
            decl
        })
        .collect();
    Some(declared)
}
