// ABOUTME: Advisory cross-process lock based on exclusive file creation.
// ABOUTME: Spins with jitter, reclaims stale or orphaned locks, releases on drop.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NestError;

/// Shortest sleep between acquisition attempts.
pub const LOCK_SPIN_MIN: Duration = Duration::from_millis(5);
/// Longest sleep between acquisition attempts.
pub const LOCK_SPIN_MAX: Duration = Duration::from_millis(25);
/// Total wait before the holder is inspected.
pub const LOCK_WAIT_CEILING: Duration = Duration::from_secs(3);
/// Age after which a lock is reclaimed regardless of its holder.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Timing parameters for [`NestLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub spin_min: Duration,
    pub spin_max: Duration,
    pub wait_ceiling: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            spin_min: LOCK_SPIN_MIN,
            spin_max: LOCK_SPIN_MAX,
            wait_ceiling: LOCK_WAIT_CEILING,
            stale_after: LOCK_STALE_AFTER,
        }
    }
}

/// Contents of a lock file: `<pid>:<millis since epoch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at_ms: i64,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Parse `pid:timestamp`. Returns `None` for anything else.
    pub fn parse(content: &str) -> Option<Self> {
        let (pid, ts) = content.trim().split_once(':')?;
        Some(Self {
            pid: pid.parse().ok()?,
            acquired_at_ms: ts.parse().ok()?,
        })
    }

    fn encode(&self) -> String {
        format!("{}:{}", self.pid, self.acquired_at_ms)
    }

    fn age(&self) -> Duration {
        let ms = Utc::now().timestamp_millis() - self.acquired_at_ms;
        Duration::from_millis(ms.max(0) as u64)
    }
}

/// Advisory lock guarding multi-field nest mutations.
///
/// Exclusion between processes comes from `create_new` on the lock file.
/// Tasks within one process queue on an in-memory mutex first so they do not
/// spin against each other.
pub struct NestLock {
    path: PathBuf,
    local: Mutex<()>,
    settings: LockSettings,
}

impl NestLock {
    /// Create a lock backed by the file at `path` with default timings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_settings(path, LockSettings::default())
    }

    pub fn with_settings(path: impl Into<PathBuf>, settings: LockSettings) -> Self {
        Self {
            path: path.into(),
            local: Mutex::new(()),
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting up to the ceiling.
    ///
    /// After the ceiling the holder is inspected: a lock older than the
    /// staleness window, or held by a process that no longer exists, is
    /// deleted and acquisition starts over. Otherwise this returns
    /// [`NestError::LockTimeout`].
    pub async fn acquire(&self) -> Result<LockGuard<'_>, NestError> {
        let local = self.local.lock().await;
        let mut started = Instant::now();

        loop {
            match try_create(&self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "Nest lock acquired");
                    return Ok(LockGuard {
                        path: &self.path,
                        _local: local,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= self.settings.wait_ceiling {
                let holder = fs::read_to_string(&self.path)
                    .ok()
                    .and_then(|c| LockHolder::parse(&c));

                if self.is_reclaimable(holder) {
                    warn!(
                        path = %self.path.display(),
                        holder_pid = ?holder.map(|h| h.pid),
                        "Reclaiming stale nest lock"
                    );
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    started = Instant::now();
                    continue;
                }

                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    path = %self.path.display(),
                    holder_pid = ?holder.map(|h| h.pid),
                    waited_ms,
                    "Timed out waiting for nest lock"
                );
                return Err(NestError::LockTimeout {
                    path: self.path.clone(),
                    holder_pid: holder.map(|h| h.pid),
                    waited_ms,
                });
            }

            let jitter = {
                let lo = self.settings.spin_min.as_millis() as u64;
                let hi = (self.settings.spin_max.as_millis() as u64).max(lo);
                rand::rng().random_range(lo..=hi)
            };
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    fn is_reclaimable(&self, holder: Option<LockHolder>) -> bool {
        match holder {
            Some(h) => h.age() > self.settings.stale_after || !process_alive(h.pid),
            // Unreadable content: a writer crashed between create and write,
            // or the file vanished. Fall back to the file's own age.
            None => match fs::metadata(&self.path).and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .elapsed()
                    .map(|age| age > self.settings.stale_after)
                    .unwrap_or(false),
                Err(_) => true,
            },
        }
    }
}

/// Held nest lock. The lock file is removed when the guard drops, on every
/// exit path including `?` returns, panics and cancelled futures.
pub struct LockGuard<'a> {
    path: &'a Path,
    _local: MutexGuard<'a, ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match fs::remove_file(self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Nest lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release nest lock"),
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(LockHolder::current().encode().as_bytes()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
