//! Disk-utilization probe and walker throttling
//!
//! Joggers call [`is_throttle_walk`] every visited file and, when the
//! probe reports utilization at or above the configured maximum, sleep
//! [`THROTTLE_1MS`] (bulk removals use [`THROTTLE_10MS`]).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub const THROTTLE_1MS: Duration = Duration::from_millis(1);
pub const THROTTLE_10MS: Duration = Duration::from_millis(10);

/// Every N-th visit probes; keeps the hot loop cheap.
#[must_use]
pub fn is_throttle_walk(nvisits: u64, every: u64) -> bool {
    every > 0 && nvisits % every == 0
}

/// System-wide disk-utilization percentage, refreshed by the housekeeper
/// from `/proc/diskstats` io-ticks deltas. Reads are a single atomic load.
#[derive(Debug, Default)]
pub struct DiskUtilProbe {
    pct: AtomicU32,
    last_io_ms: AtomicU32,
}

impl DiskUtilProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pct(&self) -> u32 {
        self.pct.load(Ordering::Relaxed)
    }

    /// Housekeeper tick: recompute utilization over the elapsed window.
    pub fn refresh(&self, elapsed: Duration) {
        let Some(io_ms) = read_io_ticks_ms() else {
            return;
        };
        let prev = self.last_io_ms.swap(io_ms, Ordering::Relaxed);
        if prev == 0 || io_ms < prev {
            return;
        }
        let window_ms = elapsed.as_millis().max(1) as u32;
        let pct = ((io_ms - prev) * 100 / window_ms).min(100);
        self.pct.store(pct, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn set_pct_for_test(&self, pct: u32) {
        self.pct.store(pct, Ordering::Relaxed);
    }
}

/// Max io-ticks (ms spent doing I/O) across physical disks.
fn read_io_ticks_ms() -> Option<u32> {
    let raw = std::fs::read_to_string("/proc/diskstats").ok()?;
    let mut max_ticks = 0u64;
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // field 2 is the device name, field 12 is io-ticks
        if fields.len() < 13 {
            continue;
        }
        let dev = fields[2];
        if dev.starts_with("loop") || dev.starts_with("ram") {
            continue;
        }
        if let Ok(ticks) = fields[12].parse::<u64>() {
            max_ticks = max_ticks.max(ticks);
        }
    }
    Some((max_ticks % u64::from(u32::MAX)) as u32)
}
