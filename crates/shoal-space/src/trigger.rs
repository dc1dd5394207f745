//! Out-of-space auto-trigger
//!
//! An OOS (or near-OOS) capacity reading kicks off cleanup — and LRU if
//! cleanup did not help — but never more often than once per
//! [`MIN_AUTO_DETECT_INTERVAL`], so a wedged disk cannot thrash the
//! target with back-to-back runs.

use shoal_fs::CapStatus;
use shoal_stats::{alert, Tracker};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

pub const MIN_AUTO_DETECT_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct SpaceTrigger {
    epoch: Instant,
    last_trig_ms: AtomicI64,
    min_interval: Duration,
}

impl Default for SpaceTrigger {
    fn default() -> Self {
        Self::new(MIN_AUTO_DETECT_INTERVAL)
    }
}

impl SpaceTrigger {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_trig_ms: AtomicI64::new(-1),
            min_interval,
        }
    }

    /// Inspect a capacity reading: raise the node alerts and decide
    /// whether a cleanup run is due now.
    pub fn should_run(&self, cs: &CapStatus, stats: &Tracker) -> bool {
        if cs.oos {
            stats.set_flag(alert::OOS);
        } else if cs.high_wm {
            stats.set_flag(alert::LOW_CAPACITY);
        } else {
            stats.clr_flag(alert::OOS);
            stats.clr_flag(alert::LOW_CAPACITY);
            return false;
        }
        let now_ms = self.epoch.elapsed().as_millis() as i64;
        let last = self.last_trig_ms.load(Ordering::Relaxed);
        if last >= 0 && now_ms - last < self.min_interval.as_millis() as i64 {
            warn!(%cs, "space pressure, but the previous cleanup ran too recently");
            return false;
        }
        self.last_trig_ms.store(now_ms, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressured() -> CapStatus {
        CapStatus {
            oos: true,
            high_wm: true,
            pct_max: 97,
            ..Default::default()
        }
    }

    #[test]
    fn test_rate_limited() {
        let stats = Tracker::new();
        let trig = SpaceTrigger::new(Duration::from_secs(600));
        assert!(trig.should_run(&pressured(), &stats));
        assert!(
            !trig.should_run(&pressured(), &stats),
            "second trigger within the interval is suppressed"
        );
        assert_ne!(stats.flags() & alert::OOS, 0);
    }

    #[test]
    fn test_flags_track_state() {
        let stats = Tracker::new();
        let trig = SpaceTrigger::new(Duration::ZERO);
        let mut cs = pressured();
        cs.oos = false;
        assert!(trig.should_run(&cs, &stats));
        assert_ne!(stats.flags() & alert::LOW_CAPACITY, 0);
        assert_eq!(stats.flags() & alert::OOS, 0);

        cs.high_wm = false;
        assert!(!trig.should_run(&cs, &stats), "healthy capacity never triggers");
        assert_eq!(stats.flags() & alert::LOW_CAPACITY, 0);
    }
}
