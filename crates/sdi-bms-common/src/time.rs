//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the battery aggregation runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Capture an instant suitable for staleness comparisons.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Elapsed time between two instants, zero when `later` precedes `earlier`.
///
/// Frames and ticks arrive from different execution contexts, so a frame may
/// carry a timestamp slightly newer than the tick evaluating it.
pub fn elapsed_since(later: Instant, earlier: Instant) -> Duration {
    later.saturating_duration_since(earlier)
}

/// Fraction of `total` covered by `elapsed`, clamped to `[0, 1]`.
pub fn progress(elapsed: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates_for_reordered_instants() {
        let base = Instant::now();
        let later = base + Duration::from_secs(2);
        assert_eq!(elapsed_since(later, base), Duration::from_secs(2));
        assert_eq!(elapsed_since(base, later), Duration::ZERO);
    }

    #[test]
    fn progress_is_clamped() {
        let total = Duration::from_secs(15);
        assert_eq!(progress(Duration::ZERO, total), 0.0);
        assert!((progress(Duration::from_millis(7500), total) - 0.5).abs() < 1e-9);
        assert_eq!(progress(Duration::from_secs(30), total), 1.0);
        assert_eq!(progress(Duration::from_secs(1), Duration::ZERO), 1.0);
    }
}
