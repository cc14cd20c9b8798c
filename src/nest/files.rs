// ABOUTME: Atomic JSON file helpers for the nest.
// ABOUTME: Writes go to a temp file in the same directory, then rename over the target.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::NestError;

/// Prefix and suffix of in-flight temp files, used to clean up after crashes.
const TMP_PREFIX: &str = ".";
const TMP_SUFFIX: &str = ".tmp";

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), NestError> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("{} has no parent", path.display())))?;
    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TMP_PREFIX)
        .suffix(TMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| NestError::Io(e.error))?;
    Ok(())
}

/// Read and parse a JSON file. Missing or corrupt files read as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring corrupt nest file");
            None
        }
    }
}

/// Remove temp files left behind by interrupted atomic writes.
///
/// Only files untouched for at least `older_than` are removed; younger ones
/// may belong to a write still in flight in another process.
pub fn remove_interrupted_writes(dir: &Path, older_than: Duration) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX)) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= older_than {
            debug!(path = %entry.path().display(), "Removing interrupted write");
            let _ = fs::remove_file(entry.path());
        }
    }
}
