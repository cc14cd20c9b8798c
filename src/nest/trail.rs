// ABOUTME: Append-only pheromone trail stored as JSON lines.
// ABOUTME: Incremental reads, decay on read, file index rebuild, periodic compaction.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::NestError;
use crate::model::{MAX_PHEROMONE_CONTENT, Pheromone, truncate_chars};
use crate::pheromone::{PheromoneIndex, decayed_strength, is_evaporated};

/// Reads between compactions. Compaction also requires evaporated records.
pub const COMPACT_EVERY_READS: u32 = 10;

#[derive(Debug, Default)]
struct TrailState {
    /// Bytes of the file already consumed.
    offset: u64,
    /// Undecayed records still above the floor at the last read.
    records: Vec<Pheromone>,
    known: HashSet<String>,
    index: PheromoneIndex,
    reads_since_compaction: u32,
    evaporated_since_compaction: usize,
}

/// The pheromone log of one colony.
///
/// Appends from any process are single `write` calls of one line in append
/// mode. Compaction rewrites the file from this process's view; two
/// coordinating processes compacting at once can drop each other's appends.
pub struct PheromoneTrail {
    path: PathBuf,
    state: Mutex<TrailState>,
}

impl PheromoneTrail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(TrailState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one pheromone as a single line.
    pub fn append(&self, pheromone: &Pheromone) -> Result<(), NestError> {
        let mut record = pheromone.clone();
        record.content = truncate_chars(&record.content, MAX_PHEROMONE_CONTENT);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        // Held so in-process appends never interleave with compaction.
        let _state = self.state.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Live pheromones with strengths decayed to `now`.
    ///
    /// Only bytes appended since the previous call are parsed. Evaporated
    /// records are dropped, the file index is rebuilt, and every
    /// [`COMPACT_EVERY_READS`] calls the file is rewritten if anything
    /// evaporated in the meantime.
    pub fn read_all(&self, now: DateTime<Utc>) -> Vec<Pheromone> {
        let mut state = self.state.lock();
        self.ingest_new_lines(&mut state);

        let before = state.records.len();
        let mut live_records = Vec::with_capacity(before);
        let mut live = Vec::with_capacity(before);
        for record in std::mem::take(&mut state.records) {
            let strength = decayed_strength(record.strength, record.created_at, now);
            if is_evaporated(strength) {
                state.known.remove(&record.id);
                continue;
            }
            let mut view = record.clone();
            view.strength = strength;
            live.push(view);
            live_records.push(record);
        }
        state.evaporated_since_compaction += before - live_records.len();
        state.records = live_records;
        state.index = PheromoneIndex::build(live.clone());

        state.reads_since_compaction += 1;
        if state.reads_since_compaction >= COMPACT_EVERY_READS {
            if state.evaporated_since_compaction > 0 {
                if let Err(e) = self.compact(&mut state) {
                    debug!(path = %self.path.display(), error = %e, "Pheromone compaction failed");
                }
            }
            state.reads_since_compaction = 0;
        }

        live
    }

    /// The file index built by the most recent [`read_all`](Self::read_all).
    pub fn index(&self) -> PheromoneIndex {
        self.state.lock().index.clone()
    }

    /// Forget everything read so far; the next read starts from byte zero.
    pub fn reset(&self) {
        *self.state.lock() = TrailState::default();
    }

    fn ingest_new_lines(&self, state: &mut TrailState) {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Cannot open pheromone trail");
                return;
            }
        };

        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < state.offset {
            // Rewritten by another process's compaction.
            state.offset = 0;
        }
        if len == state.offset {
            return;
        }

        let mut buf = Vec::new();
        if file.seek(SeekFrom::Start(state.offset)).is_err() || file.read_to_end(&mut buf).is_err() {
            return;
        }

        // A trailing partial line belongs to an append still in flight.
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let complete = &buf[..=last_newline];
        state.offset += complete.len() as u64;

        for line in complete.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Pheromone>(line) {
                Ok(p) => {
                    if state.known.insert(p.id.clone()) {
                        state.records.push(p);
                    }
                }
                Err(e) => trace!(error = %e, "Skipping unparsable pheromone line"),
            }
        }
    }

    fn compact(&self, state: &mut TrailState) -> Result<(), NestError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| std::io::Error::other("pheromone trail has no parent directory"))?;
        let mut body = Vec::new();
        for record in &state.records {
            body.extend(serde_json::to_vec(record)?);
            body.push(b'\n');
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| NestError::Io(e.error))?;

        debug!(
            path = %self.path.display(),
            kept = state.records.len(),
            dropped = state.evaporated_since_compaction,
            "Compacted pheromone trail"
        );
        state.offset = body.len() as u64;
        state.evaporated_since_compaction = 0;
        Ok(())
    }
}

/// Render the strongest `limit` pheromones as a ranked digest for a prompt.
/// An empty `files` slice selects from every live pheromone.
pub fn digest(index: &PheromoneIndex, files: &[String], limit: usize) -> String {
    let mut chosen: Vec<&Pheromone> = if files.is_empty() {
        index.pheromones().iter().collect()
    } else {
        index.relevant_to(files)
    };
    chosen.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    chosen.truncate(limit);

    let mut out = String::new();
    for p in chosen {
        out.push_str(&format!(
            "- [{} {:.2}] ({}) {}",
            p.kind, p.strength, p.ant_caste, p.content
        ));
        if !p.files.is_empty() {
            out.push_str(&format!(" [files: {}]", p.files.join(", ")));
        }
        out.push('\n');
    }
    out
}
