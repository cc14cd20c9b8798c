// ABOUTME: Exponential pheromone decay with a fixed half-life.
// ABOUTME: Strength is always derived from creation time, never accumulated.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time for a pheromone's strength to halve.
pub const HALF_LIFE: Duration = Duration::from_secs(10 * 60);

/// Pheromones weaker than this are evaporated from the log.
pub const EVAPORATION_FLOOR: f64 = 0.05;

/// Strength of a pheromone deposited at `initial` strength at `created_at`,
/// observed at `now`. Clock skew (a creation time in the future) counts as
/// zero elapsed time.
pub fn decayed_strength(initial: f64, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed_ms = (now - created_at).num_milliseconds().max(0) as f64;
    let half_life_ms = HALF_LIFE.as_millis() as f64;
    initial * 0.5_f64.powf(elapsed_ms / half_life_ms)
}

/// Whether a strength has dropped below the evaporation floor.
pub fn is_evaporated(strength: f64) -> bool {
    strength < EVAPORATION_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_half_life() {
        let t0 = Utc::now();
        let later = t0 + ChronoDuration::minutes(10);
        let s = decayed_strength(1.0, t0, later);
        assert!((s - 0.5).abs() < 1e-9, "got {}", s);
    }

    #[test]
    fn test_future_creation_is_undecayed() {
        let now = Utc::now();
        let s = decayed_strength(1.0, now + ChronoDuration::seconds(30), now);
        assert_eq!(s, 1.0);
    }

    #[test]
    fn test_monotone_and_crosses_floor_once() {
        let t0 = Utc::now();
        let mut previous = f64::MAX;
        let mut crossings = 0;
        let mut was_live = true;
        for minute in 0..120 {
            let s = decayed_strength(1.0, t0, t0 + ChronoDuration::minutes(minute));
            assert!(s <= previous, "strength rose at minute {}", minute);
            previous = s;
            let live = !is_evaporated(s);
            if was_live && !live {
                crossings += 1;
            }
            assert!(was_live || !live, "resurrected at minute {}", minute);
            was_live = live;
        }
        assert_eq!(crossings, 1);
    }
}
