// ABOUTME: Best-effort classification of failure text into coarse error classes.
// ABOUTME: An ordered pattern table; the first matching row wins.

use std::fmt;

/// Coarse category of a task failure, used for telemetry only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TypeError,
    Permission,
    Timeout,
    NotFound,
    Syntax,
    RateLimit,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TypeError => "type_error",
            ErrorClass::Permission => "permission",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Syntax => "syntax",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase substrings per class, checked top to bottom.
const PATTERNS: &[(&[&str], ErrorClass)] = &[
    (
        &["429", "rate limit", "rate_limit", "too many requests"],
        ErrorClass::RateLimit,
    ),
    (
        &["401", "403", "eacces", "eperm", "permission denied", "unauthorized", "forbidden"],
        ErrorClass::Permission,
    ),
    (
        &["etimedout", "timeout", "timed out", "deadline exceeded"],
        ErrorClass::Timeout,
    ),
    (
        &["enoent", "cannot find module", "no such file", "not found", "module not found"],
        ErrorClass::NotFound,
    ),
    (
        &["typeerror", "type error", "mismatched types", "is not a function", "is not assignable"],
        ErrorClass::TypeError,
    ),
    (
        &["syntaxerror", "syntax error", "unexpected token", "parse error", "unexpected end of"],
        ErrorClass::Syntax,
    ),
];

/// Classify failure text. Matching is case-insensitive and may miss.
pub fn classify_error(text: &str) -> ErrorClass {
    let lower = text.to_ascii_lowercase();
    PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, class)| *class)
        .unwrap_or(ErrorClass::Unknown)
}
