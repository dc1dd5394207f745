//! Bulk data-movement jobs
//!
//! Everything long-running that the target executes on behalf of the
//! cluster: bucket/multi-object copy with optional ETL, prefetch,
//! archive shards, multi-object delete/evict, resilver (local reshuffle)
//! and rebalance (cross-target), plus the sentinel protocol that
//! cluster-wide jobs use to agree on termination.

pub mod archive;
pub mod copy;
pub mod etl;
pub mod listrange;
pub mod prefetch;
pub mod ratelim;
pub mod rebalance;
pub mod resilver;
pub mod sentinel;

pub use copy::{run_tcb, run_tco};
pub use listrange::run_delete_evict;
pub use prefetch::run_prefetch;
pub use rebalance::{run_rebalance, RebReceiver};
pub use resilver::run_resilver;
pub use sentinel::Sentinel;

use shoal_common::Error;
use shoal_xact::XactBase;
use std::sync::Arc;

/// `num_workers` semantics shared by every multi-object job:
/// 0 = one per mountpath, -1 = serial.
#[must_use]
pub fn effective_workers(num_workers: i32, num_mountpaths: usize) -> usize {
    match num_workers {
        0 => num_mountpaths.max(1),
        n if n < 0 => 1,
        n => n as usize,
    }
}

/// Per-object error policy shared by the jobs: out-of-space always
/// aborts, not-found is recorded but non-fatal, everything else aborts
/// unless `continue_on_error`.
pub(crate) fn on_obj_err(x: &Arc<XactBase>, cname: &str, e: &Error, continue_on_error: bool) -> bool {
    x.add_err(format!("{cname}: {e}"));
    if matches!(e, Error::OutOfSpace(_)) {
        x.abort(e.to_string());
        return false;
    }
    if e.is_not_found() {
        return true;
    }
    if !continue_on_error {
        x.abort(e.to_string());
        return false;
    }
    true
}
