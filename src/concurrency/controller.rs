// ABOUTME: Adaptive concurrency controller - a pure function from load history
// ABOUTME: and pending work to the next target parallelism.

use chrono::Duration;

use crate::model::{ConcurrencyConfig, LoadSample};

/// Trailing average CPU load above which parallelism is reduced.
pub const CPU_OVERLOAD: f64 = 0.85;
/// CPU load at or above which increases are frozen.
pub const CPU_HYSTERESIS: f64 = 0.6;
/// CPU load below which the learned optimum is restored.
pub const CPU_RECOVERY: f64 = 0.5;
/// Free memory below which parallelism is reduced.
pub const MEM_FLOOR_MB: u64 = 500;
/// Samples averaged for the overload guard.
pub const OVERLOAD_WINDOW: usize = 3;
/// Below this many samples the controller explores upward.
pub const EXPLORATION_SAMPLES: usize = 10;
/// Samples per window in the steady-state comparison.
pub const STEADY_WINDOW: usize = 5;
/// Relative throughput gain that earns an increase.
pub const IMPROVE_RATIO: f64 = 0.10;
/// Relative throughput gain that also moves the learned optimum.
pub const OPTIMAL_RATIO: f64 = 0.20;
/// Relative throughput loss that falls back to the learned optimum.
pub const REGRESS_RATIO: f64 = 0.20;
/// No increases within this window after a rate-limit signal.
pub const RATE_LIMIT_COOLDOWN_SECS: i64 = 30;

/// Compute the next concurrency config for `pending` waiting tasks.
///
/// Pure: the only clock consulted is the newest sample's timestamp, which is
/// compared against `last_rate_limit_at` for the cooldown window. The result
/// always lies in `[min, min(pending, max)]`; when `pending < min` the `min`
/// floor wins.
pub fn adapt(config: &ConcurrencyConfig, pending: usize) -> ConcurrencyConfig {
    let mut next = config.clone();

    if pending == 0 {
        next.current = config.min;
        return next;
    }

    let cap = pending.min(config.max);
    let clamp = |n: usize| n.min(cap).max(config.min);
    let history = &config.history;

    if history.len() < 2 {
        next.current = clamp(config.max.div_ceil(2));
        return next;
    }

    let latest = &history[history.len() - 1];

    if is_overloaded(history) {
        next.current = clamp(config.current.saturating_sub(1));
        return next;
    }

    let cooling = in_cooldown(config, latest);
    let can_increase = latest.cpu_load < CPU_HYSTERESIS && !cooling;

    if latest.cpu_load < CPU_RECOVERY && config.current < config.optimal && !cooling {
        next.current = clamp(config.optimal);
        return next;
    }

    if history.len() < EXPLORATION_SAMPLES {
        let previous = &history[history.len() - 2];
        if latest.throughput >= previous.throughput {
            if can_increase {
                next.current = clamp(config.current + 1);
            } else {
                next.current = clamp(config.current);
            }
        } else {
            let knee = previous.active.max(config.min);
            next.optimal = knee;
            next.current = clamp(hold_if_cooling(knee, config.current, cooling));
        }
        return next;
    }

    let n = history.len();
    let recent = mean_throughput(&history[n - STEADY_WINDOW..]);
    let before = mean_throughput(&history[n - 2 * STEADY_WINDOW..n - STEADY_WINDOW]);
    let change = relative_change(before, recent);

    if change > IMPROVE_RATIO && can_increase {
        next.current = clamp(config.current + 1);
        if change > OPTIMAL_RATIO {
            next.optimal = next.current;
        }
    } else if change < -REGRESS_RATIO {
        next.current = clamp(hold_if_cooling(config.optimal, config.current, cooling));
    } else {
        next.current = clamp(config.current);
    }
    next
}

/// A fallback target that never rises above `current` during the cooldown.
fn hold_if_cooling(target: usize, current: usize, cooling: bool) -> usize {
    if cooling { target.min(current) } else { target }
}

fn is_overloaded(history: &[LoadSample]) -> bool {
    let window = &history[history.len().saturating_sub(OVERLOAD_WINDOW)..];
    let avg_cpu = window.iter().map(|s| s.cpu_load).sum::<f64>() / window.len() as f64;
    let latest = &history[history.len() - 1];
    avg_cpu > CPU_OVERLOAD || latest.mem_free_mb < MEM_FLOOR_MB
}

fn in_cooldown(config: &ConcurrencyConfig, latest: &LoadSample) -> bool {
    match config.last_rate_limit_at {
        Some(at) => latest.timestamp - at < Duration::seconds(RATE_LIMIT_COOLDOWN_SECS),
        None => false,
    }
}

fn mean_throughput(samples: &[LoadSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.throughput).sum::<f64>() / samples.len() as f64
}

/// Relative change from `before` to `after`. A rise from zero counts as
/// unbounded improvement.
fn relative_change(before: f64, after: f64) -> f64 {
    if before <= 0.0 {
        if after > 0.0 { f64::INFINITY } else { 0.0 }
    } else {
        (after - before) / before
    }
}
