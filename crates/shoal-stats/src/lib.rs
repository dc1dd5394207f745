//! Node statistics tracker
//!
//! Cheap atomic counters keyed by well-known metric names, plus a node
//! alert bitset. The housekeeper periodically flushes non-zero deltas to
//! the log; the full snapshot backs the daemon `stats` endpoint.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Well-known metric names. Latency metrics end in `.ns`, sizes in
/// `.size`, counts in `.n`; error counters are `err.<op>.n`.
pub mod named {
    pub const GET_COUNT: &str = "get.n";
    pub const GET_LATENCY: &str = "get.ns";
    pub const GET_SIZE: &str = "get.size";
    pub const PUT_COUNT: &str = "put.n";
    pub const PUT_LATENCY: &str = "put.ns";
    pub const PUT_SIZE: &str = "put.size";
    pub const DELETE_COUNT: &str = "del.n";
    pub const COLD_GET_COUNT: &str = "get.cold.n";
    pub const COLD_GET_SIZE: &str = "get.cold.size";
    pub const LST_COUNT: &str = "lst.n";
    pub const PREFETCH_COUNT: &str = "prefetch.n";
    pub const PREFETCH_SIZE: &str = "prefetch.size";
    pub const CLEANUP_STORE_COUNT: &str = "cleanup.store.n";
    pub const CLEANUP_STORE_SIZE: &str = "cleanup.store.size";
    pub const LRU_EVICT_COUNT: &str = "lru.evict.n";
    pub const LRU_EVICT_SIZE: &str = "lru.evict.size";
    pub const STREAM_OUT_COUNT: &str = "stream.out.n";
    pub const STREAM_OUT_SIZE: &str = "stream.out.size";
    pub const STREAM_IN_COUNT: &str = "stream.in.n";
    pub const STREAM_IN_SIZE: &str = "stream.in.size";
    pub const CHAN_FULL_COUNT: &str = "chan-full.n";
    pub const VERSION_CHANGED_COUNT: &str = "ver.change.n";

    #[must_use]
    pub fn err(op: &str) -> String {
        format!("err.{op}.n")
    }
}

/// Node-state alert flags (a bitset; sticky until cleared).
pub mod alert {
    pub const OOS: u64 = 1 << 0;
    pub const LOW_CAPACITY: u64 = 1 << 1;
    pub const REBALANCE_INTERRUPTED: u64 = 1 << 2;
    pub const RESILVER_INTERRUPTED: u64 = 1 << 3;
    pub const RESTARTED: u64 = 1 << 4;
    pub const DISK_FAULT: u64 = 1 << 5;
    pub const OOM: u64 = 1 << 6;

    #[must_use]
    pub fn render(flags: u64) -> String {
        let mut out = Vec::new();
        for (bit, name) in [
            (OOS, "oos"),
            (LOW_CAPACITY, "low-capacity"),
            (REBALANCE_INTERRUPTED, "rebalance-interrupted"),
            (RESILVER_INTERRUPTED, "resilver-interrupted"),
            (RESTARTED, "restarted"),
            (DISK_FAULT, "disk-fault"),
            (OOM, "oom"),
        ] {
            if flags & bit != 0 {
                out.push(name);
            }
        }
        out.join(",")
    }
}

#[derive(Debug, Default)]
pub struct Tracker {
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
    flags: AtomicU64,
    flushed: RwLock<BTreeMap<String, i64>>,
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, name: &str) -> Arc<AtomicI64> {
        if let Some(c) = self.counters.read().get(name) {
            return Arc::clone(c);
        }
        let mut w = self.counters.write();
        Arc::clone(
            w.entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: i64) {
        self.counter(name).fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc_err(&self, op: &str) {
        self.add(&named::err(op), 1);
    }

    /// Record one operation's latency in nanoseconds (`<op>.ns` plus the
    /// matching `<op>.n` counter is the caller's responsibility).
    pub fn add_latency(&self, name: &str, elapsed: std::time::Duration) {
        self.add(name, elapsed.as_nanos() as i64);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn set_flag(&self, bit: u64) {
        self.flags.fetch_or(bit, Ordering::Relaxed);
    }

    pub fn clr_flag(&self, bit: u64) {
        self.flags.fetch_and(!bit, Ordering::Relaxed);
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Housekeeper tick: log non-zero deltas since the previous flush.
    pub fn flush(&self) {
        let snap = self.snapshot();
        let mut prev = self.flushed.write();
        let mut deltas = Vec::new();
        for (k, v) in &snap {
            let d = v - prev.get(k).copied().unwrap_or(0);
            if d != 0 {
                deltas.push(format!("{k}={d:+}"));
            }
        }
        let flags = self.flags();
        if !deltas.is_empty() || flags != 0 {
            info!(alerts = %alert::render(flags), "stats: {}", deltas.join(" "));
        }
        *prev = snap;
    }
}
