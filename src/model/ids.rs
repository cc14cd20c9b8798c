// ABOUTME: Process-local id generator for tasks, ants and pheromones.
// ABOUTME: Combines a millisecond timestamp with an atomic sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Generates ids of the form `<kind>-<millis base36>-<seq>`.
///
/// One generator is created per colony process and passed to every component
/// that mints ids. The timestamp prefix keeps ids from separate processes
/// apart; the counter keeps ids minted within the same millisecond apart.
#[derive(Debug, Default)]
pub struct IdGenerator {
    seq: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at sequence zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new id with the given kind prefix.
    pub fn next(&self, kind: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        format!("{}-{}-{}", kind, to_base36(millis), seq)
    }

    pub fn task(&self) -> String {
        self.next("task")
    }

    pub fn ant(&self) -> String {
        self.next("ant")
    }

    pub fn pheromone(&self) -> String {
        self.next("ph")
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
