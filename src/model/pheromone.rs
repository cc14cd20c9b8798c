// ABOUTME: Pheromone record - append-only, decaying evidence left by ants.
// ABOUTME: Records are never mutated on disk; strength is decayed on read.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Caste;

/// Maximum characters of content kept per pheromone.
pub const MAX_PHEROMONE_CONTENT: usize = 2000;

/// Kind of evidence a pheromone carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PheromoneType {
    Discovery,
    Progress,
    Warning,
    Completion,
    Dependency,
    Repellent,
}

impl fmt::Display for PheromoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PheromoneType::Discovery => "discovery",
            PheromoneType::Progress => "progress",
            PheromoneType::Warning => "warning",
            PheromoneType::Completion => "completion",
            PheromoneType::Dependency => "dependency",
            PheromoneType::Repellent => "repellent",
        };
        write!(f, "{}", s)
    }
}

/// Evidence record deposited by an ant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pheromone {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PheromoneType,
    pub ant_id: String,
    pub ant_caste: Caste,
    pub task_id: String,
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
    /// In `(0, 1]`. Deposited at 1.0; the in-memory view carries the decayed value.
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

impl Pheromone {
    /// Create a full-strength pheromone. Content is truncated to
    /// [`MAX_PHEROMONE_CONTENT`] characters.
    pub fn new(
        id: impl Into<String>,
        kind: PheromoneType,
        ant_id: impl Into<String>,
        ant_caste: Caste,
        task_id: impl Into<String>,
        content: &str,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            ant_id: ant_id.into(),
            ant_caste,
            task_id: task_id.into(),
            content: truncate_chars(content, MAX_PHEROMONE_CONTENT),
            files: Vec::new(),
            strength: 1.0,
            created_at: Utc::now(),
        }
    }

    pub fn files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn touches(&self, file: &str) -> bool {
        self.files.iter().any(|f| f == file)
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_is_truncated() {
        let long = "é".repeat(MAX_PHEROMONE_CONTENT + 10);
        let p = Pheromone::new("p", PheromoneType::Discovery, "a", Caste::Scout, "t", &long);
        assert_eq!(p.content.chars().count(), MAX_PHEROMONE_CONTENT);
        assert_eq!(p.strength, 1.0);
    }

    #[test]
    fn test_type_field_name() {
        let p = Pheromone::new("p", PheromoneType::Repellent, "a", Caste::Worker, "t", "x");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], "repellent");
    }
}
